//! Delivery of samples to registered consumers.

use crate::sample::Sample;

/// A consumer callback. Runs on the thread driving the read loop.
pub type Consumer<'a> = Box<dyn FnMut(&Sample) + 'a>;

/// Ordered set of consumers invoked synchronously for every sample.
#[derive(Default)]
pub struct StreamDispatcher<'a> {
    consumers: Vec<Consumer<'a>>,
    delivered: u64,
}

impl<'a> StreamDispatcher<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with a single consumer.
    pub fn single<F>(consumer: F) -> Self
    where
        F: FnMut(&Sample) + 'a,
    {
        Self::new().with(consumer)
    }

    /// Append a consumer; consumers run in registration order.
    pub fn with<F>(mut self, consumer: F) -> Self
    where
        F: FnMut(&Sample) + 'a,
    {
        self.push(consumer);
        self
    }

    pub fn push<F>(&mut self, consumer: F)
    where
        F: FnMut(&Sample) + 'a,
    {
        self.consumers.push(Box::new(consumer));
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Samples dispatched so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dispatch(&mut self, sample: &Sample) {
        for consumer in &mut self.consumers {
            consumer(sample);
        }
        self.delivered += 1;
    }
}

impl<'a> FromIterator<Consumer<'a>> for StreamDispatcher<'a> {
    fn from_iter<I: IntoIterator<Item = Consumer<'a>>>(iter: I) -> Self {
        Self {
            consumers: iter.into_iter().collect(),
            delivered: 0,
        }
    }
}
