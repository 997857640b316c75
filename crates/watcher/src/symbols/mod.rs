#![forbid(unsafe_code)]

//! Instruction pointer to `{function, file, line}`.

mod cache;

pub use cache::SymbolCache;

use crate::domain::Symbol;
use std::ffi::c_void;
use tracing::trace;

/// Debug-info lookup for a single address.
pub trait Symbolizer: Send + Sync {
    fn symbolize(&self, ip: u64) -> Option<Symbol>;
}

/// Resolves against the running binary's debug info.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktraceSymbolizer;

impl Symbolizer for BacktraceSymbolizer {
    fn symbolize(&self, ip: u64) -> Option<Symbol> {
        let mut resolved = None;
        backtrace::resolve(ip as usize as *mut c_void, |symbol| {
            if resolved.is_some() {
                return;
            }
            let Some(name) = symbol.name() else {
                return;
            };
            resolved = Some(Symbol {
                function: format!("{name:#}"),
                file: symbol
                    .filename()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
                line: symbol.lineno().unwrap_or(0),
            });
        });
        resolved
    }
}

/// Cached symbolization. Never fails: unknown addresses resolve to
/// [`Symbol::unknown`].
pub struct SymbolResolver {
    cache: SymbolCache,
    symbolizer: Box<dyn Symbolizer>,
}

impl std::fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl SymbolResolver {
    pub fn new(cache: SymbolCache, symbolizer: Box<dyn Symbolizer>) -> Self {
        Self { cache, symbolizer }
    }

    pub fn resolve(&self, ip: u64) -> Symbol {
        if ip == 0 {
            return Symbol::unknown();
        }
        if let Some(symbol) = self.cache.get(ip) {
            return symbol;
        }
        let symbol = self.symbolizer.symbolize(ip).unwrap_or_else(|| {
            trace!(ip = format_args!("{ip:#x}"), "no symbol");
            Symbol::unknown()
        });
        self.cache.set(ip, symbol.clone());
        symbol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl Symbolizer for Counting {
        fn symbolize(&self, ip: u64) -> Option<Symbol> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (ip != 0xbad).then(|| Symbol {
                function: format!("fn_{ip:x}"),
                file: "src/lib.rs".into(),
                line: 10,
            })
        }
    }

    fn resolver() -> (SymbolResolver, Arc<AtomicUsize>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let symbolizer = Counting::default();
        let calls = symbolizer.calls.clone();
        let cache = SymbolCache::new(1000, Duration::from_secs(3600), clock.clone());
        (
            SymbolResolver::new(cache, Box::new(symbolizer)),
            calls,
            clock,
        )
    }

    #[test]
    fn hit_within_ttl_miss_after() {
        let (resolver, calls, clock) = resolver();
        assert_eq!(resolver.resolve(0x40).function, "fn_40");
        clock.advance(Duration::from_secs(100));
        resolver.resolve(0x40);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(3501));
        resolver.resolve(0x40);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failures_resolve_to_sentinel() {
        let (resolver, calls, _) = resolver();
        let symbol = resolver.resolve(0xbad);
        assert_eq!(symbol, Symbol::unknown());
        assert_eq!((symbol.file.as_str(), symbol.line), ("", 0));

        assert!(resolver.resolve(0).is_unknown());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolves_own_code() {
        let ip = resolves_own_code as fn() as usize as u64;
        // Debug info may be stripped; either outcome is acceptable but a hit
        // must name this function.
        if let Some(symbol) = BacktraceSymbolizer.symbolize(ip) {
            assert!(symbol.function.contains("resolves_own_code"), "{symbol:?}");
        }
    }
}
