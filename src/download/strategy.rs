//! Ordered fallback strategies.
//!
//! Each strategy is tried in turn; every attempt is recorded with its name and
//! outcome so a final failure can be diagnosed from the log alone.

use std::fmt;

/// A named variant of an operation, e.g. a yt-dlp client or format selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub name: &'static str,
    pub extra_args: Vec<String>,
}

impl Strategy {
    pub fn new(name: &'static str, extra_args: &[&str]) -> Self {
        Self {
            name,
            extra_args: extra_args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Errors a strategy chain can reason about.
pub trait StrategyError: fmt::Display {
    /// Whether a later strategy may still succeed
    fn worth_fallback(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: &'static str,
    pub error: String,
}

/// Every failed attempt plus the last error.
#[derive(Debug)]
pub struct ChainFailure<E> {
    pub attempts: Vec<Attempt>,
    /// `None` only when no strategies were configured
    pub last: Option<E>,
}

/// Runs `attempt` for each strategy until one succeeds.
///
/// Stops early when an error says no other strategy can help.
pub fn run_chain<T, E, F>(label: &str, strategies: &[Strategy], mut attempt: F) -> Result<T, ChainFailure<E>>
where
    E: StrategyError,
    F: FnMut(&Strategy) -> Result<T, E>,
{
    let mut attempts = Vec::with_capacity(strategies.len());
    let mut last = None;

    for strategy in strategies {
        log::info!("🔄 {}: trying strategy '{}'", label, strategy.name);
        match attempt(strategy) {
            Ok(value) => {
                if !attempts.is_empty() {
                    log::info!("✅ {}: strategy '{}' succeeded after {} failure(s)", label, strategy.name, attempts.len());
                }
                return Ok(value);
            }
            Err(e) => {
                log::warn!("⚠️ {}: strategy '{}' failed: {}", label, strategy.name, e);
                attempts.push(Attempt {
                    strategy: strategy.name,
                    error: e.to_string(),
                });
                let stop = !e.worth_fallback();
                last = Some(e);
                if stop {
                    log::warn!("{}: error is final, skipping remaining strategies", label);
                    break;
                }
            }
        }
    }

    if last.is_none() {
        log::error!("{}: no strategies configured", label);
    }
    Err(ChainFailure { attempts, last })
}
