//! Pull-side sources: hand out at most one unit per demand step.

use crate::demand::Demand;
use crate::publication::Supply;

/// A pull-based source.
///
/// Given the demand the consumer currently declares, a producer yields at
/// most one unit of supply. It must be safe to call repeatedly until it
/// reports [`Supply::Finished`] or [`Supply::Failure`]. After it has been
/// handed [`Demand::Cancel`] it never yields another value.
pub trait Producer<T>: Send {
    fn produce(&mut self, demand: Demand) -> Supply<T>;
}

impl<T, F> Producer<T> for F
where
    F: FnMut(Demand) -> Supply<T> + Send,
{
    fn produce(&mut self, demand: Demand) -> Supply<T> {
        self(demand)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Exhausted,
    Cancelled,
}

/// Producer over any iterator.
#[derive(Debug)]
pub struct IterProducer<I> {
    iter: I,
    remaining: Demand,
    phase: Phase,
}

impl<I: Iterator> IterProducer<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
            remaining: Demand::None,
            phase: Phase::Active,
        }
    }

    /// Demand left over after the most recent delivery.
    pub fn remaining(&self) -> Demand {
        self.remaining
    }
}

impl<I> Producer<I::Item> for IterProducer<I>
where
    I: Iterator + Send,
{
    fn produce(&mut self, demand: Demand) -> Supply<I::Item> {
        match self.phase {
            Phase::Exhausted | Phase::Cancelled => return Supply::Finished,
            Phase::Active => {}
        }
        if demand.is_cancel() {
            self.phase = Phase::Cancelled;
            self.remaining = Demand::Cancel;
            return Supply::Finished;
        }

        self.remaining = demand;
        if !self.remaining.has_room() {
            return Supply::Pending;
        }
        match self.iter.next() {
            Some(value) => {
                self.remaining = self.remaining.decremented();
                Supply::Value(value)
            }
            None => {
                self.phase = Phase::Exhausted;
                Supply::Finished
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T>(producer: &mut impl Producer<T>, demand: Demand) -> (Vec<T>, bool) {
        let mut values = Vec::new();
        loop {
            match producer.produce(demand) {
                Supply::Value(value) => values.push(value),
                Supply::Finished => return (values, true),
                Supply::Failure(_) | Supply::Pending => return (values, false),
            }
        }
    }

    #[test]
    fn test_unlimited_demand_drains_in_order() {
        let mut producer = IterProducer::new([5, 4, 3, 2, 1, 0]);
        let (values, finished) = drain(&mut producer, Demand::Unlimited);
        assert_eq!(values, vec![5, 4, 3, 2, 1, 0]);
        assert!(finished);
        // Terminal state latches.
        assert!(matches!(producer.produce(Demand::Unlimited), Supply::Finished));
    }

    #[test]
    fn test_cancel_stops_permanently() {
        let mut producer = IterProducer::new([5, 4, 3, 2, 1, 0]);
        assert!(matches!(producer.produce(Demand::Unlimited), Supply::Value(5)));
        assert!(matches!(producer.produce(Demand::Unlimited), Supply::Value(4)));
        assert!(matches!(producer.produce(Demand::Cancel), Supply::Finished));

        // Demand re-sent after cancel never yields another value.
        for _ in 0..4 {
            assert!(matches!(producer.produce(Demand::Unlimited), Supply::Finished));
        }
        assert_eq!(producer.remaining(), Demand::Cancel);
    }

    #[test]
    fn test_no_demand_is_pending() {
        let mut producer = IterProducer::new(1..=3);
        assert!(matches!(producer.produce(Demand::None), Supply::Pending));
        assert!(matches!(producer.produce(Demand::Max(0)), Supply::Pending));
        assert!(matches!(producer.produce(Demand::max(1)), Supply::Value(1)));
    }

    #[test]
    fn test_finite_demand_is_decremented() {
        let mut producer = IterProducer::new(1..=10);
        assert!(matches!(producer.produce(Demand::max(2)), Supply::Value(1)));
        assert_eq!(producer.remaining(), Demand::Max(1));
        assert!(matches!(producer.produce(producer.remaining()), Supply::Value(2)));
        assert_eq!(producer.remaining(), Demand::None);
        assert!(matches!(producer.produce(producer.remaining()), Supply::Pending));
    }

    #[test]
    fn test_closure_producer() {
        let mut next = 0;
        let mut producer = move |demand: Demand| {
            if !demand.has_room() {
                return Supply::Pending;
            }
            next += 1;
            if next > 2 {
                Supply::Finished
            } else {
                Supply::Value(next)
            }
        };
        let (values, finished) = drain(&mut producer, Demand::Unlimited);
        assert_eq!(values, vec![1, 2]);
        assert!(finished);
    }
}
