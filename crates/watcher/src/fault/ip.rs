#![forbid(unsafe_code)]

//! Where was the faulting thread when it trapped?
//!
//! A thread blocked in a page fault is not inside a system call, so
//! `/proc/self/task/<tid>/syscall` reads `-1 <sp> <pc>`. The last field is
//! the program counter of the faulting instruction.

/// Program counter of thread `tid`, or `0` when it cannot be read.
pub fn probe(tid: u32) -> u64 {
    std::fs::read_to_string(format!("/proc/self/task/{tid}/syscall"))
        .ok()
        .and_then(|line| parse_program_counter(&line))
        .unwrap_or(0)
}

fn parse_program_counter(line: &str) -> Option<u64> {
    let last = line.split_whitespace().next_back()?;
    let digits = last.strip_prefix("0x")?;
    u64::from_str_radix(digits, 16).ok()
}
