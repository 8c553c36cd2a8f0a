//! Continuous polling of one or more power meters sharing a bus.
//!
//! Every meter has its own due time. A good reading pushes it out by the poll
//! interval, a failed one (communication error or an all-zero reading) only by the
//! retry interval.

use anyhow::{bail, Result};
use log::*;
use pzem004t_lib::{protocol as proto, tokio_sync_safe_client::SafeClient};
use std::time::{Duration, Instant};

/// A polled meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sensor {
    /// Tag used in logs and console output.
    pub name: String,
    pub address: proto::Address,
    /// Overrides the poll interval of the schedule.
    pub poll_interval: Option<Duration>,
}

impl Sensor {
    /// A sensor named after its address, polled at the schedule's interval.
    pub fn from_address(address: proto::Address) -> Self {
        Self {
            name: address.to_string(),
            address,
            poll_interval: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    sensor: Sensor,
    due: Instant,
}

/// Due times of the polled meters.
#[derive(Debug)]
pub struct Schedule {
    entries: Vec<Entry>,
    poll_interval: Duration,
    retry_interval: Duration,
}

impl Schedule {
    /// All meters are due at `now`. Duplicate addresses are polled once, the first
    /// entry wins.
    pub fn new(
        sensors: Vec<Sensor>,
        poll_interval: Duration,
        retry_interval: Duration,
        now: Instant,
    ) -> Self {
        let mut entries: Vec<Entry> = Vec::with_capacity(sensors.len());
        for sensor in sensors {
            if entries.iter().any(|e| e.sensor.address == sensor.address) {
                warn!(
                    "[{}] Address {} configured twice, ignored",
                    sensor.name, sensor.address
                );
                continue;
            }
            entries.push(Entry { sensor, due: now });
        }
        Self {
            entries,
            poll_interval,
            retry_interval,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Meters due at `now`, in configuration order.
    pub fn due(&self, now: Instant) -> Vec<Sensor> {
        self.entries
            .iter()
            .filter(|e| e.due <= now)
            .map(|e| e.sensor.clone())
            .collect()
    }

    /// Earliest due time of all meters.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.due).min()
    }

    pub fn record_success(&mut self, address: proto::Address, now: Instant) {
        let default_interval = self.poll_interval;
        if let Some(entry) = self.entry_mut(address) {
            entry.due = now + entry.sensor.poll_interval.unwrap_or(default_interval);
        }
    }

    pub fn record_failure(&mut self, address: proto::Address, now: Instant) {
        let retry_interval = self.retry_interval;
        if let Some(entry) = self.entry_mut(address) {
            entry.due = now + retry_interval;
        }
    }

    fn entry_mut(&mut self, address: proto::Address) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.sensor.address == address)
    }
}

/// Reads every meter due at `now` and hands the good readings to `publish`.
///
/// Failed reads and all-zero readings are logged and rescheduled for a retry. Only
/// an error returned by `publish` is passed on.
pub fn poll_due<R, P>(
    schedule: &mut Schedule,
    now: Instant,
    mut read: R,
    mut publish: P,
) -> Result<()>
where
    R: FnMut(&Sensor) -> Result<proto::Measurement>,
    P: FnMut(&Sensor, &proto::Measurement) -> Result<()>,
{
    for sensor in schedule.due(now) {
        info!(
            "[{}] Starting read from sensor addr={}",
            sensor.name, sensor.address
        );
        match read(&sensor) {
            Ok(measurement) if measurement.is_all_zero() => {
                error!(
                    "[{}] Read succeeded but all values are zero, treating as failed",
                    sensor.name
                );
                schedule.record_failure(sensor.address, now);
            }
            Ok(measurement) => {
                debug!("[{}] Read OK: {measurement}", sensor.name);
                publish(&sensor, &measurement)?;
                schedule.record_success(sensor.address, now);
            }
            Err(err) => {
                error!(
                    "[{}] Failed to read sensor at addr={}: {err:#}",
                    sensor.name, sensor.address
                );
                schedule.record_failure(sensor.address, now);
            }
        }
    }
    Ok(())
}

/// Polls the meters forever and hands every good reading to `publish`.
pub fn run<P>(
    client: &mut SafeClient,
    schedule: &mut Schedule,
    delay: Duration,
    mut publish: P,
) -> Result<()>
where
    P: FnMut(&Sensor, &proto::Measurement) -> Result<()>,
{
    if schedule.is_empty() {
        bail!("No sensors to poll");
    }
    loop {
        poll_due(
            schedule,
            Instant::now(),
            |sensor| {
                client.set_slave(sensor.address);
                let result = client.read_measurement();
                // Keeps the next meter from answering too early on a shared bus.
                std::thread::sleep(delay);
                Ok(result?)
            },
            &mut publish,
        )?;

        if let Some(next) = schedule.next_due() {
            std::thread::sleep(next.saturating_duration_since(Instant::now()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    const POLL: Duration = Duration::from_secs(60);
    const RETRY: Duration = Duration::from_secs(2);

    fn addr(value: u8) -> proto::Address {
        proto::Address::try_from(value).unwrap()
    }

    fn sensors(addresses: &[u8]) -> Vec<Sensor> {
        addresses.iter().map(|a| Sensor::from_address(addr(*a))).collect()
    }

    fn measurement() -> proto::Measurement {
        proto::Measurement::decode_from_input_registers(&[
            2301, 0, 1234, 0, 2839, 0, 42, 499, 87, 0,
        ])
        .unwrap()
    }

    fn zero_measurement() -> proto::Measurement {
        proto::Measurement::decode_from_input_registers(&[0; 10]).unwrap()
    }

    #[test]
    fn everything_due_at_start() {
        let now = Instant::now();
        let schedule = Schedule::new(sensors(&[1, 0xA5, 1]), POLL, RETRY, now);
        let due: Vec<_> = schedule.due(now).into_iter().map(|s| s.address).collect();
        assert_eq!(due, [addr(1), addr(0xA5)]);
        assert_eq!(schedule.next_due(), Some(now));
    }

    #[test]
    fn sensor_named_after_address() {
        let sensor = Sensor::from_address(addr(0xA5));
        assert_eq!(sensor.name, "0xa5");
        assert_eq!(sensor.poll_interval, None);
    }

    #[test]
    fn success_waits_poll_interval() {
        let start = Instant::now();
        let mut schedule = Schedule::new(sensors(&[1]), POLL, RETRY, start);
        schedule.record_success(addr(1), start);
        assert!(schedule.due(start + Duration::from_secs(59)).is_empty());
        assert_eq!(schedule.due(start + POLL).len(), 1);
        assert_eq!(schedule.next_due(), Some(start + POLL));
    }

    #[test]
    fn success_uses_sensor_poll_interval() {
        let start = Instant::now();
        let mut fast = Sensor::from_address(addr(2));
        fast.poll_interval = Some(Duration::from_secs(10));
        let mut schedule =
            Schedule::new(vec![Sensor::from_address(addr(1)), fast], POLL, RETRY, start);
        schedule.record_success(addr(1), start);
        schedule.record_success(addr(2), start);
        assert_eq!(schedule.next_due(), Some(start + Duration::from_secs(10)));
    }

    #[test]
    fn failure_waits_retry_interval() {
        let start = Instant::now();
        let mut schedule = Schedule::new(sensors(&[1, 2]), POLL, RETRY, start);
        schedule.record_success(addr(1), start);
        schedule.record_failure(addr(2), start);
        assert_eq!(schedule.next_due(), Some(start + RETRY));
        assert_eq!(schedule.due(start + RETRY).len(), 1);
        assert_eq!(schedule.due(start + POLL).len(), 2);
    }

    #[test]
    fn unknown_address_is_ignored() {
        let start = Instant::now();
        let mut schedule = Schedule::new(sensors(&[1]), POLL, RETRY, start);
        schedule.record_failure(addr(9), start);
        assert_eq!(schedule.next_due(), Some(start));
    }

    #[test]
    fn empty_schedule() {
        let schedule = Schedule::new(Vec::new(), POLL, RETRY, Instant::now());
        assert!(schedule.is_empty());
        assert_eq!(schedule.next_due(), None);
    }

    #[test]
    fn poll_publishes_good_reading() {
        let start = Instant::now();
        let mut schedule = Schedule::new(sensors(&[1]), POLL, RETRY, start);
        let mut published = Vec::new();
        poll_due(
            &mut schedule,
            start,
            |_| Ok(measurement()),
            |sensor, m| {
                published.push((sensor.address, *m));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(published, [(addr(1), measurement())]);
        assert_eq!(schedule.next_due(), Some(start + POLL));
    }

    #[test]
    fn poll_all_zero_is_failure() {
        let start = Instant::now();
        let mut schedule = Schedule::new(sensors(&[1]), POLL, RETRY, start);
        let mut published = 0;
        poll_due(
            &mut schedule,
            start,
            |_| Ok(zero_measurement()),
            |_, _| {
                published += 1;
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(published, 0);
        assert_eq!(schedule.next_due(), Some(start + RETRY));
    }

    #[test]
    fn poll_read_error_is_failure() {
        let start = Instant::now();
        let mut schedule = Schedule::new(sensors(&[1, 2]), POLL, RETRY, start);
        let mut published = Vec::new();
        poll_due(
            &mut schedule,
            start,
            |sensor| {
                if sensor.address == addr(1) {
                    Err(anyhow!("timeout"))
                } else {
                    Ok(measurement())
                }
            },
            |sensor, _| {
                published.push(sensor.address);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(published, [addr(2)]);
        assert_eq!(schedule.next_due(), Some(start + RETRY));
        let due: Vec<_> = schedule.due(start + RETRY).into_iter().map(|s| s.address).collect();
        assert_eq!(due, [addr(1)]);
    }

    #[test]
    fn poll_skips_sensors_not_due() {
        let start = Instant::now();
        let mut schedule = Schedule::new(sensors(&[1, 2]), POLL, RETRY, start);
        schedule.record_success(addr(1), start);
        let mut read = Vec::new();
        poll_due(
            &mut schedule,
            start + RETRY,
            |sensor| {
                read.push(sensor.address);
                Ok(measurement())
            },
            |_, _| Ok(()),
        )
        .unwrap();
        assert_eq!(read, [addr(2)]);
    }

    #[test]
    fn poll_stops_on_publish_error() {
        let start = Instant::now();
        let mut schedule = Schedule::new(sensors(&[1]), POLL, RETRY, start);
        let result = poll_due(
            &mut schedule,
            start,
            |_| Ok(measurement()),
            |_, _| Err(anyhow!("broker gone")),
        );
        assert!(result.is_err());
        // Not rescheduled, the reading was never delivered.
        assert_eq!(schedule.next_due(), Some(start));
    }
}
