use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::clock::{SystemTime, TimeSource};
use crate::header::Header;
use crate::header_set::HeaderSet;
use crate::metrics::{report_consolidated_headers, report_timer_error};

#[derive(Debug, Clone, Default)]
pub struct ConsolidatorOptions {
    /// Used in logs and metric labels.
    pub name: String,
    /// Period of the snapshot timer, `None` or zero disables it.
    pub interval: Option<Duration>,
    /// Headers older than this are never returned, `None` or zero keeps them forever.
    pub time_to_live: Option<Duration>,
    /// Fire the first snapshot when the timer starts instead of one interval later.
    pub fire_immediately: bool,
}

struct Window {
    headers: RwLock<HeaderSet>,
    time_to_live: Option<time::Duration>,
    clock: Arc<dyn TimeSource>,
}

impl Window {
    /// Oldest timestamp still inside the window. Inclusive.
    fn cutoff(&self) -> Option<OffsetDateTime> {
        let ttl = self.time_to_live?;
        self.clock.now().checked_sub(ttl)
    }

    fn is_live(&self, header: &Header, cutoff: Option<OffsetDateTime>) -> bool {
        cutoff.map_or(true, |cutoff| header.timestamp >= cutoff)
    }

    fn add_header(&self, header: Header) {
        self.headers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_header(header);
    }

    fn header_count(&self) -> usize {
        let cutoff = self.cutoff();
        self.headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .headers()
            .filter(|header| self.is_live(header, cutoff))
            .count()
    }

    fn sorted_headers(&self) -> Vec<Header> {
        let cutoff = self.cutoff();
        self.headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sorted_headers()
            .into_iter()
            .filter(|header| self.is_live(header, cutoff))
            .cloned()
            .collect()
    }

    fn remove_expired(&self) -> usize {
        match self.cutoff() {
            Some(cutoff) => self
                .headers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_headers_older_than(cutoff),
            None => 0,
        }
    }
}

/// A time-windowed, latest-value-per-identity view over the record stream.
///
/// Each instance owns its header set: feeding the same header to several
/// consolidators never shares state between them. Expired headers are
/// filtered on every read and pruned on every timer tick.
///
/// When an interval is configured, [`start_timer`](Self::start_timer) spawns
/// a task on the current tokio runtime that hands a sorted snapshot to the
/// handler once per interval. Ticks never overlap: the next one waits for the
/// handler to return. Anything the handler spawns is not awaited.
pub struct HeaderSetConsolidator {
    name: String,
    interval: Option<Duration>,
    fire_immediately: bool,
    window: Arc<Window>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl HeaderSetConsolidator {
    pub fn new(options: ConsolidatorOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemTime {}))
    }

    pub fn with_clock(options: ConsolidatorOptions, clock: Arc<dyn TimeSource>) -> Self {
        let time_to_live = options
            .time_to_live
            .filter(|ttl| !ttl.is_zero())
            .and_then(|ttl| time::Duration::try_from(ttl).ok());

        Self {
            name: options.name,
            interval: options.interval.filter(|interval| !interval.is_zero()),
            fire_immediately: options.fire_immediately,
            window: Arc::new(Window {
                headers: RwLock::new(HeaderSet::new()),
                time_to_live,
                clock,
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores the header, replacing the previous header of the same identity.
    pub fn add_header(&self, header: Header) {
        self.window.add_header(header)
    }

    /// Number of headers inside the window.
    pub fn header_count(&self) -> usize {
        self.window.header_count()
    }

    /// Headers inside the window, ordered by identity.
    pub fn sorted_headers(&self) -> Vec<Header> {
        self.window.sorted_headers()
    }

    /// Drops headers that fell out of the window, returns how many.
    pub fn remove_expired(&self) -> usize {
        self.window.remove_expired()
    }

    pub fn is_timer_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Starts emitting snapshots to `handler` every interval. Does nothing if
    /// the interval is disabled or the timer is already running.
    ///
    /// Handler errors and panics are logged and counted, the timer keeps firing.
    pub fn start_timer<F>(&self, mut handler: F)
    where
        F: FnMut(Vec<Header>) -> eyre::Result<()> + Send + 'static,
    {
        let Some(period) = self.interval else {
            debug!("{} has no interval, timer not started", self.name);
            return;
        };

        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            warn!("{} timer already running", self.name);
            return;
        }

        let start = match self.fire_immediately {
            true => Instant::now(),
            false => Instant::now() + period,
        };
        let mut ticker = tokio_time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let name = self.name.clone();
        let window = self.window.clone();

        *timer = Some(tokio::spawn(async move {
            loop {
                ticker.tick().await;

                let expired = window.remove_expired();
                if expired > 0 {
                    debug!("{} dropped {} expired headers", name, expired);
                }

                let headers = window.sorted_headers();
                report_consolidated_headers(&name, headers.len());

                match catch_unwind(AssertUnwindSafe(|| handler(headers))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!("{} snapshot handler failed: {:?}", name, err);
                        report_timer_error(&name);
                    }
                    Err(_) => {
                        error!("{} snapshot handler panicked", name);
                        report_timer_error(&name);
                    }
                }
            }
        }));
        debug!("{} timer started with a {:?} interval", self.name, period);
    }

    /// Cancels future snapshots. Safe to call repeatedly.
    pub fn stop_timer(&self) {
        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("{} timer stopped", self.name);
        }
    }
}

impl Drop for HeaderSetConsolidator {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;
    use tokio::sync::mpsc;

    fn header(source_address: u16, at: OffsetDateTime) -> Header {
        Header {
            channel: 0,
            destination_address: 0x0010,
            source_address,
            protocol_version: 0x10,
            command: 0x0100,
            timestamp: at,
            frame_data: vec![],
        }
    }

    fn windowed(clock: Arc<ManualTime>, time_to_live: Option<Duration>) -> HeaderSetConsolidator {
        HeaderSetConsolidator::with_clock(
            ConsolidatorOptions {
                name: "test".to_owned(),
                time_to_live,
                ..Default::default()
            },
            clock,
        )
    }

    fn timed(interval: Option<Duration>, fire_immediately: bool) -> HeaderSetConsolidator {
        HeaderSetConsolidator::new(ConsolidatorOptions {
            name: "timed".to_owned(),
            interval,
            fire_immediately,
            ..Default::default()
        })
    }

    #[test]
    fn add_header_overwrites_by_identity() {
        let start = datetime!(2024-03-01 12:00 UTC);
        let consolidator = windowed(Arc::new(ManualTime::new(start)), None);

        consolidator.add_header(header(0x4278, start));
        consolidator.add_header(header(0x4278, start + time::Duration::seconds(1)));
        consolidator.add_header(header(0x7e11, start));

        assert_eq!(consolidator.header_count(), 2);
        let sorted = consolidator.sorted_headers();
        assert_eq!(sorted[0].id(), "00_0010_4278_10_0100");
        assert_eq!(sorted[0].timestamp, start + time::Duration::seconds(1));
        assert_eq!(sorted[1].id(), "00_0010_7E11_10_0100");
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let start = datetime!(2024-03-01 12:00 UTC);
        let clock = Arc::new(ManualTime::new(start));
        let consolidator = windowed(clock.clone(), Some(Duration::from_secs(60)));
        consolidator.add_header(header(0x4278, start));

        clock.advance(time::Duration::seconds(60));
        assert_eq!(consolidator.header_count(), 1);
        assert_eq!(consolidator.sorted_headers().len(), 1);

        clock.advance(time::Duration::milliseconds(1));
        assert_eq!(consolidator.header_count(), 0);
        assert!(consolidator.sorted_headers().is_empty());
        assert_eq!(consolidator.remove_expired(), 1);
    }

    #[test]
    fn fresh_header_refreshes_recency() {
        let start = datetime!(2024-03-01 12:00 UTC);
        let clock = Arc::new(ManualTime::new(start));
        let consolidator = windowed(clock.clone(), Some(Duration::from_secs(60)));
        consolidator.add_header(header(0x4278, start));
        consolidator.add_header(header(0x7e11, start));

        clock.advance(time::Duration::seconds(45));
        consolidator.add_header(header(0x4278, clock.now()));
        clock.advance(time::Duration::seconds(45));

        let ids: Vec<String> = consolidator.sorted_headers().iter().map(Header::id).collect();
        assert_eq!(ids, vec!["00_0010_4278_10_0100"]);
    }

    #[test]
    fn no_window_keeps_everything() {
        let start = datetime!(2024-03-01 12:00 UTC);
        let clock = Arc::new(ManualTime::new(start));
        let consolidator = windowed(clock.clone(), Some(Duration::ZERO));
        consolidator.add_header(header(0x4278, start));

        clock.advance(time::Duration::days(365));
        assert_eq!(consolidator.header_count(), 1);
        assert_eq!(consolidator.remove_expired(), 0);
    }

    #[test]
    fn instances_do_not_share_state() {
        let start = datetime!(2024-03-01 12:00 UTC);
        let clock = Arc::new(ManualTime::new(start));
        let first = windowed(clock.clone(), None);
        let second = windowed(clock, None);

        let shared = header(0x4278, start);
        first.add_header(shared.clone());
        second.add_header(shared);
        first.add_header(header(0x7e11, start));

        assert_eq!(first.header_count(), 2);
        assert_eq!(second.header_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_snapshot_after_one_interval() {
        let consolidator = timed(Some(Duration::from_secs(10)), false);
        consolidator.add_header(header(0x4278, OffsetDateTime::now_utc()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        consolidator.start_timer(move |headers| {
            tx.send(headers.len())?;
            Ok(())
        });
        assert!(consolidator.is_timer_running());

        tokio_time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        tokio_time::sleep(Duration::from_secs(30)).await;
        let mut ticks = Vec::new();
        while let Ok(count) = rx.try_recv() {
            ticks.push(count);
        }
        assert_eq!(ticks, vec![1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_immediately_snapshots_at_start() {
        let consolidator = timed(Some(Duration::from_secs(10)), true);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        consolidator.start_timer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tokio_time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        tokio_time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_errors_do_not_stop_the_timer() {
        let consolidator = timed(Some(Duration::from_secs(10)), false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        consolidator.start_timer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(eyre::eyre!("publish failed"))
        });

        tokio_time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_does_not_stop_the_timer() {
        let consolidator = timed(Some(Duration::from_secs(10)), false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        consolidator.start_timer(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("derivation blew up");
            }
            Ok(())
        });

        tokio_time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(consolidator.is_timer_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_timer_is_idempotent() {
        let consolidator = timed(Some(Duration::from_secs(10)), false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        consolidator.start_timer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tokio_time::sleep(Duration::from_secs(15)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        consolidator.stop_timer();
        consolidator.stop_timer();
        assert!(!consolidator.is_timer_running());

        tokio_time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_interval_never_fires() {
        for interval in [None, Some(Duration::ZERO)] {
            let consolidator = timed(interval, true);
            let ticks = Arc::new(AtomicUsize::new(0));
            let counter = ticks.clone();

            consolidator.start_timer(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

            tokio_time::sleep(Duration::from_secs(100)).await;
            assert!(!consolidator.is_timer_running());
            assert_eq!(ticks.load(Ordering::SeqCst), 0);
        }
    }
}
