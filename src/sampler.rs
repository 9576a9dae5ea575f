use embassy_time::{Duration, Instant, Timer};
use portable_atomic::{AtomicU32, Ordering::SeqCst};

use crate::Mutex;

/// One set of calibrated values from a single measurement cycle.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurement {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub gas_resistance: f64,
}

#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub gas_resistance: f64,
    pub taken_at: Instant,
}

/// A sensor that is measured in discrete trigger/wait/read cycles. The caller
/// owns the wait; issuing a second trigger before the read completes is
/// undefined at the device level.
#[allow(async_fn_in_trait)]
pub trait TriggeredSensor {
    type Error;

    async fn trigger_measurement(&mut self) -> Result<(), Self::Error>;
    async fn read_measurement(&mut self) -> Result<Measurement, Self::Error>;
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleError<E> {
    Trigger(E),
    Read(E),
}

/// Latest published reading. Kept apart from the sensor lock so readers never
/// wait out an in-flight measurement cycle.
pub struct ReadingCache {
    slot: Mutex<Option<Reading>>,
    publications: AtomicU32,
}

impl ReadingCache {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            publications: AtomicU32::new(0),
        }
    }

    /// `None` until the first cycle has completed.
    pub async fn latest(&self) -> Option<Reading> {
        *self.slot.lock().await
    }

    pub async fn publish(&self, reading: Reading) {
        *self.slot.lock().await = Some(reading);
        self.publications.fetch_add(1, SeqCst);
    }

    pub fn publication_count(&self) -> u32 {
        self.publications.load(SeqCst)
    }
}

/// Drives the sensor through its measurement cycles, one at a time.
///
/// Concurrent callers queue on the sensor mutex; whoever held it publishes its
/// reading before releasing, and queued callers take that reading instead of
/// starting another cycle. The heater only fires once per burst of requests.
pub struct Sampler<S> {
    sensor: Mutex<S>,
    cache: ReadingCache,
    conversion_time: Duration,
}

impl<S: TriggeredSensor> Sampler<S> {
    /// `conversion_time` is the device-reported measurement duration. It is
    /// fixed for as long as the sensor configuration is, so it is captured
    /// here once instead of being re-queried every cycle.
    pub fn new(sensor: S, conversion_time: Duration) -> Self {
        Self {
            sensor: Mutex::new(sensor),
            cache: ReadingCache::new(),
            conversion_time,
        }
    }

    /// Runs one trigger/wait/read cycle and publishes the result.
    ///
    /// The cache is only written on a fully successful cycle; a failed trigger
    /// or read leaves the previous reading in place and releases the sensor.
    pub async fn acquire(&self) -> Result<Reading, SampleError<S::Error>> {
        let seen = self.cache.publication_count();
        let mut sensor = self.sensor.lock().await;
        if self.cache.publication_count() != seen {
            // A cycle completed while we were queued on the sensor lock; its
            // reading is newer than anything that existed when we started.
            if let Some(reading) = self.cache.latest().await {
                return Ok(reading);
            }
        }

        sensor
            .trigger_measurement()
            .await
            .map_err(SampleError::Trigger)?;
        Timer::after(self.conversion_time).await;
        let values = sensor
            .read_measurement()
            .await
            .map_err(SampleError::Read)?;

        let reading = Reading {
            temperature: values.temperature,
            humidity: values.humidity,
            pressure: values.pressure,
            gas_resistance: values.gas_resistance,
            taken_at: Instant::now(),
        };
        self.cache.publish(reading).await;
        Ok(reading)
    }

    /// Latest published reading without touching the sensor.
    pub async fn latest(&self) -> Option<Reading> {
        self.cache.latest().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::future::Future;
    use core::pin::pin;
    use core::task::{Context, Poll, Waker};
    use embassy_futures::block_on;
    use embassy_futures::join::{join, join_array};
    use portable_atomic::AtomicBool;

    #[derive(Default)]
    struct Telemetry {
        triggers: AtomicU32,
        cycle: AtomicU32,
        in_flight: AtomicBool,
        overlaps: AtomicU32,
        fail_trigger: AtomicBool,
        fail_read: AtomicBool,
    }

    struct FakeSensor<'a> {
        t: &'a Telemetry,
    }

    impl TriggeredSensor for FakeSensor<'_> {
        type Error = ();

        async fn trigger_measurement(&mut self) -> Result<(), ()> {
            if self.t.fail_trigger.load(SeqCst) {
                return Err(());
            }
            if self.t.in_flight.swap(true, SeqCst) {
                self.t.overlaps.fetch_add(1, SeqCst);
            }
            self.t.triggers.fetch_add(1, SeqCst);
            self.t.cycle.fetch_add(1, SeqCst);
            Ok(())
        }

        async fn read_measurement(&mut self) -> Result<Measurement, ()> {
            self.t.in_flight.store(false, SeqCst);
            if self.t.fail_read.load(SeqCst) {
                return Err(());
            }
            // Values tagged by cycle number so cross-cycle mixing shows up.
            let c = self.t.cycle.load(SeqCst) as f64;
            Ok(Measurement {
                temperature: c,
                humidity: c + 0.25,
                pressure: c + 0.5,
                gas_resistance: c + 0.75,
            })
        }
    }

    fn sampler(t: &Telemetry, conversion: Duration) -> Sampler<FakeSensor<'_>> {
        Sampler::new(FakeSensor { t }, conversion)
    }

    fn assert_single_cycle(r: &Reading) {
        assert_eq!(r.humidity, r.temperature + 0.25);
        assert_eq!(r.pressure, r.temperature + 0.5);
        assert_eq!(r.gas_resistance, r.temperature + 0.75);
    }

    #[test]
    fn no_reading_before_first_cycle() {
        let t = Telemetry::default();
        let s = sampler(&t, Duration::from_millis(1));
        assert!(block_on(s.latest()).is_none());
    }

    #[test]
    fn acquire_publishes_a_complete_reading() {
        let t = Telemetry::default();
        let s = sampler(&t, Duration::from_millis(1));
        let r = block_on(s.acquire()).unwrap();
        assert_eq!(r.temperature, 1.0);
        assert_single_cycle(&r);
        let cached = block_on(s.latest()).unwrap();
        assert_eq!(cached.temperature, r.temperature);
    }

    #[test]
    fn sequential_acquires_run_fresh_cycles() {
        let t = Telemetry::default();
        let s = sampler(&t, Duration::from_millis(1));
        let first = block_on(s.acquire()).unwrap();
        let second = block_on(s.acquire()).unwrap();
        assert_eq!(t.triggers.load(SeqCst), 2);
        assert!(second.temperature > first.temperature);
    }

    #[test]
    fn concurrent_acquires_coalesce_onto_one_cycle() {
        let t = Telemetry::default();
        let s = sampler(&t, Duration::from_millis(20));
        let readings = block_on(async {
            join_array([s.acquire(), s.acquire(), s.acquire(), s.acquire()]).await
        });
        for r in &readings {
            let r = r.as_ref().unwrap();
            assert_eq!(r.temperature, 1.0);
            assert_single_cycle(r);
        }
        assert_eq!(t.triggers.load(SeqCst), 1);
        assert_eq!(t.overlaps.load(SeqCst), 0);
        assert!(!t.in_flight.load(SeqCst));
    }

    #[test]
    fn triggers_never_overlap_across_bursts() {
        let t = Telemetry::default();
        let s = sampler(&t, Duration::from_millis(5));
        block_on(async {
            for _ in 0..3 {
                let (a, b) = join(s.acquire(), s.acquire()).await;
                assert_single_cycle(&a.unwrap());
                assert_single_cycle(&b.unwrap());
            }
        });
        assert_eq!(t.overlaps.load(SeqCst), 0);
    }

    #[test]
    fn read_failure_keeps_previous_reading() {
        let t = Telemetry::default();
        let s = sampler(&t, Duration::from_millis(1));
        let good = block_on(s.acquire()).unwrap();

        t.fail_read.store(true, SeqCst);
        assert!(matches!(block_on(s.acquire()), Err(SampleError::Read(()))));
        let cached = block_on(s.latest()).unwrap();
        assert_eq!(cached.temperature, good.temperature);

        // Sensor lock must have been released by the failed cycle.
        t.fail_read.store(false, SeqCst);
        let fresh = block_on(s.acquire()).unwrap();
        assert!(fresh.temperature > good.temperature);
    }

    #[test]
    fn trigger_failure_releases_the_sensor() {
        let t = Telemetry::default();
        let s = sampler(&t, Duration::from_millis(1));
        t.fail_trigger.store(true, SeqCst);
        assert!(matches!(
            block_on(s.acquire()),
            Err(SampleError::Trigger(()))
        ));
        assert!(block_on(s.latest()).is_none());

        t.fail_trigger.store(false, SeqCst);
        assert!(block_on(s.acquire()).is_ok());
    }

    #[test]
    fn acquire_waits_out_the_conversion_time() {
        let t = Telemetry::default();
        let conversion = Duration::from_millis(50);
        let s = sampler(&t, conversion);
        let before = Instant::now();
        block_on(s.acquire()).unwrap();
        assert!(Instant::now() - before >= conversion);
    }

    #[test]
    fn dropped_acquire_does_not_wedge_the_sampler() {
        let t = Telemetry::default();
        let s = sampler(&t, Duration::from_millis(50));
        {
            let mut fut = pin!(s.acquire());
            let mut cx = Context::from_waker(Waker::noop());
            // First poll gets as far as the conversion wait, then the request
            // context goes away (client timeout).
            assert!(matches!(fut.as_mut().poll(&mut cx), Poll::Pending));
        }
        let r = block_on(s.acquire()).unwrap();
        assert_single_cycle(&r);
    }
}
