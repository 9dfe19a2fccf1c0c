use bitflags::bitflags;

#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Turns ticks into events. Keeps the policy apart from the loop that
/// counts.
pub(crate) trait TickerData {
    type Context;

    // Events are ordered by importance, the most important one wins.
    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Serve the lowest non-empty priority on the next pick.
        const FAIRNESS = 1;

        /// A request to shut down the runtime.
        const SHUTDOWN = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EveryThird;

    impl TickerData for EveryThird {
        type Context = bool;

        fn update_and_check(&mut self, stop: &bool, tick: u32) -> TickerEvents {
            if *stop {
                TickerEvents::SHUTDOWN
            } else if tick.is_multiple_of(3) {
                TickerEvents::FAIRNESS
            } else {
                TickerEvents::empty()
            }
        }
    }

    #[test]
    fn test_ticks_drive_events() {
        let mut ticker = Ticker::new();
        let events = (0..6)
            .map(|_| ticker.tick(&false, &mut EveryThird))
            .collect::<Vec<_>>();

        assert_eq!(
            events,
            vec![
                TickerEvents::empty(),
                TickerEvents::empty(),
                TickerEvents::FAIRNESS,
                TickerEvents::empty(),
                TickerEvents::empty(),
                TickerEvents::FAIRNESS,
            ]
        );
        assert_eq!(ticker.tick(&true, &mut EveryThird), TickerEvents::SHUTDOWN);
    }
}
