use std::time::Duration;

/// Lets at most one item through per `window`.
///
/// Items arriving inside the window replace each other; the latest is handed out by
/// [`Throttle::flush`] once the window has passed.
#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    last_emit: Option<Duration>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
            pending: None,
        }
    }

    pub fn offer(&mut self, now: Duration, item: T) -> Option<T> {
        if self.is_open(now) {
            self.last_emit = Some(now);
            self.pending = None;
            Some(item)
        } else {
            self.pending = Some(item);
            None
        }
    }

    pub fn flush(&mut self, now: Duration) -> Option<T> {
        if self.pending.is_some() && self.is_open(now) {
            self.last_emit = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.last_emit = None;
        self.pending = None;
    }

    fn is_open(&self, now: Duration) -> bool {
        self.last_emit
            .map_or(true, |last| now.saturating_sub(last) >= self.window)
    }
}
