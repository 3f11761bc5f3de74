//! Client-local periodic tickers.
//!
//! One ticker task per distinct period. Ticks are funneled into the driver
//! as events so timer dispatch happens on the driver task like everything
//! else; the ticker itself never touches client state.

use crate::dispatch::DriverEvent;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Spawn the ticker for `period`. The first tick fires immediately, then
/// every `period` milliseconds. The task ends when the driver goes away;
/// registry teardown aborts it explicitly before that.
pub fn spawn_ticker(period: u64, events: UnboundedSender<DriverEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(period));
        loop {
            ticker.tick().await;
            if events.send(DriverEvent::TimerTick { period }).is_err() {
                break;
            }
        }
    })
}
