//! Concurrent workload drivers.
//!
//! Each driver runs whole transactions on several threads and retries any
//! transaction the engine ends (deadlock kill, commit failure), the way a
//! client is expected to.

use persist_core::{CoreError, CoreResult, Engine, Session, Value};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Transactions that committed.
    pub committed: usize,
    /// Attempts the engine ended and the driver retried.
    pub retried: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    /// Committed transactions per second.
    pub fn commits_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.committed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Worker threads.
    pub threads: usize,
    /// Committed transactions per thread.
    pub transactions_per_thread: usize,
    /// Distinct keys the workload touches.
    pub keys: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            transactions_per_thread: 100,
            keys: 8,
        }
    }
}

/// Runs `body` in a fresh transaction until it commits, retrying whenever
/// the engine ends the transaction. Returns how many attempts were ended.
///
/// # Errors
///
/// Returns the first error that does not end the transaction.
pub fn run_to_commit(
    session: &mut Session,
    mut body: impl FnMut(&mut Session) -> CoreResult<()>,
) -> CoreResult<usize> {
    let mut retries = 0;
    loop {
        let attempt = body(session).and_then(|()| session.commit());
        match attempt {
            Ok(()) => return Ok(retries),
            Err(e) if e.ends_transaction() => {
                session.rollback();
                retries += 1;
            }
            Err(e) => {
                session.rollback();
                return Err(e);
            }
        }
    }
}

fn account(i: usize) -> String {
    format!("acct-{i}")
}

fn balance(session: &mut Session, name: &str) -> CoreResult<i64> {
    let value = session.read_existing(name, Value::INTEGER)?;
    value
        .as_integer()
        .ok_or_else(|| CoreError::NotFound {
            key: persist_core::EntityKey::new(Value::INTEGER, name),
        })
}

/// Creates `config.keys` accounts holding `initial` each.
pub fn seed_accounts(engine: &Engine, config: &StressConfig, initial: i64) -> CoreResult<()> {
    let mut session = engine.open_session()?;
    for i in 0..config.keys {
        session.write(&account(i), Value::INTEGER, Some(Value::Integer(initial)))?;
    }
    session.commit()
}

/// Sums every account.
pub fn total_balance(engine: &Engine, config: &StressConfig) -> CoreResult<i64> {
    let mut session = engine.open_session()?;
    let mut total = 0;
    for i in 0..config.keys {
        total += balance(&mut session, &account(i))?;
    }
    session.commit()?;
    Ok(total)
}

/// Moves one unit between pseudo-random account pairs on every thread.
///
/// Transfers lock two accounts in either order, so deadlocks happen and
/// are resolved by killing one side; the total balance never changes.
pub fn stress_transfers(engine: &Engine, config: &StressConfig) -> CoreResult<StressTestResult> {
    let start = Instant::now();
    let outcomes: Vec<CoreResult<usize>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..config.threads)
            .map(|t| {
                scope.spawn(move || -> CoreResult<usize> {
                    let mut session = engine.open_session()?;
                    let mut retried = 0;
                    for n in 0..config.transactions_per_thread {
                        let from = (t * 7 + n * 3) % config.keys;
                        let to = (from + 1 + (n + t) % (config.keys - 1)) % config.keys;
                        retried += run_to_commit(&mut session, |s| {
                            let a = balance(s, &account(from))?;
                            let b = balance(s, &account(to))?;
                            s.write(&account(from), Value::INTEGER, Some(Value::Integer(a - 1)))?;
                            s.write(&account(to), Value::INTEGER, Some(Value::Integer(b + 1)))
                        })?;
                    }
                    Ok(retried)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("stress worker panicked"))
            .collect()
    });

    let mut retried = 0;
    for outcome in outcomes {
        retried += outcome?;
    }
    Ok(StressTestResult {
        committed: config.threads * config.transactions_per_thread,
        retried,
        duration: start.elapsed(),
    })
}

/// Increments one counter from every thread.
pub fn stress_counter(engine: &Engine, config: &StressConfig, name: &str) -> CoreResult<StressTestResult> {
    let start = Instant::now();
    let outcomes: Vec<CoreResult<usize>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..config.threads)
            .map(|_| {
                scope.spawn(move || -> CoreResult<usize> {
                    let mut session = engine.open_session()?;
                    let mut retried = 0;
                    for _ in 0..config.transactions_per_thread {
                        retried += run_to_commit(&mut session, |s| {
                            let current = s
                                .read(name, Value::INTEGER)?
                                .and_then(|v| v.as_integer())
                                .unwrap_or(0);
                            s.write(name, Value::INTEGER, Some(Value::Integer(current + 1)))
                        })?;
                    }
                    Ok(retried)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("stress worker panicked"))
            .collect()
    });

    let mut retried = 0;
    for outcome in outcomes {
        retried += outcome?;
    }
    Ok(StressTestResult {
        committed: config.threads * config.transactions_per_thread,
        retried,
        duration: start.elapsed(),
    })
}
