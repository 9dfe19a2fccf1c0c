use crate::context;
use crate::runtime::pool::Pool;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::utils::ScopeGuard;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Event loop of one pool thread.
pub(super) struct Worker {
    pool: Arc<Pool>,

    /// Started to replace a blocked worker. Exits after `idle_timeout`
    /// without work.
    overcommit: bool,

    ticker: Ticker,
    policy: FairnessPolicy,

    /// Whether the next pick starts from the lowest priority.
    lowest_first: bool,

    should_unpark: Arc<AtomicBool>,
}

impl Worker {
    pub(super) fn new(pool: Arc<Pool>, overcommit: bool) -> Self {
        let policy = FairnessPolicy {
            interval: pool.cfg.fairness_interval,
        };

        Self {
            pool,
            overcommit,
            ticker: Ticker::new(),
            policy,
            lowest_first: false,
            should_unpark: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(super) fn run(mut self) {
        context::set_worker(Arc::clone(&self.pool));

        let pool = Arc::clone(&self.pool);
        let _exit = ScopeGuard::new(move || {
            context::clear_worker();
            pool.worker_exited();
        });

        tracing::trace!(overcommit = self.overcommit, "worker started");

        'event_loop: loop {
            if let Some(task) = self.pool.find_task(std::mem::take(&mut self.lowest_first)) {
                task.invoke();
            } else {
                let timeout = self.overcommit.then_some(self.pool.cfg.idle_timeout);
                if !self.pool.park_current_thread(&self.should_unpark, timeout) {
                    tracing::trace!("idle overcommit worker exiting");
                    break 'event_loop;
                }
            }

            let events = self.ticker.tick(&*self.pool, &mut self.policy);
            if let ControlFlow::Break(_) = self.process_ticker_events(events) {
                break 'event_loop;
            }
        }
    }

    #[inline(always)]
    fn process_ticker_events(&mut self, events: TickerEvents) -> ControlFlow<()> {
        if events.contains(TickerEvents::SHUTDOWN) {
            return ControlFlow::Break(());
        } else if events.contains(TickerEvents::FAIRNESS) {
            self.lowest_first = true;
        }

        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone)]
struct FairnessPolicy {
    interval: u32,
}

impl TickerData for FairnessPolicy {
    type Context = Pool;

    #[inline(always)]
    fn update_and_check(&mut self, pool: &Pool, tick: u32) -> TickerEvents {
        if pool.is_shutdown() {
            TickerEvents::SHUTDOWN
        } else if tick.is_multiple_of(self.interval) {
            TickerEvents::FAIRNESS
        } else {
            TickerEvents::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;

    #[test]
    fn test_worker_ticks_against_its_pool() -> anyhow::Result<()> {
        let pool = Pool::new(&RuntimeConfig::default());
        let mut worker = Worker::new(Arc::clone(&pool), false);
        worker.policy.interval = 2;

        let events = worker.ticker.tick(&*worker.pool, &mut worker.policy);
        assert_eq!(worker.process_ticker_events(events), ControlFlow::Continue(()));
        assert!(!worker.lowest_first);

        let events = worker.ticker.tick(&*worker.pool, &mut worker.policy);
        assert_eq!(events, TickerEvents::FAIRNESS);
        assert_eq!(worker.process_ticker_events(events), ControlFlow::Continue(()));
        assert!(worker.lowest_first);

        pool.shutdown()?;
        let events = worker.ticker.tick(&*worker.pool, &mut worker.policy);
        assert_eq!(worker.process_ticker_events(events), ControlFlow::Break(()));
        Ok(())
    }
}
