//! Ping counting for calibration sweeps.
//!
//! The device never acknowledges that a new setting took effect. The only evidence is the
//! settings block of the 7000 record sent with every ping, so a sweep steps to the next
//! setting once enough pings have reported the current one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::{Command, CommandLink};
use crate::error::Result;
use crate::record::PingSettings;

/// Largest difference between a commanded and a reported setting that still counts as a match
pub const SETTING_TOLERANCE: f32 = 0.01;

/// Which ping setting the counter follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SettingField {
    Frequency,
    Range,
    Power,
    #[default]
    Gain,
    Absorption,
    Spreading,
}

impl SettingField {
    pub fn extract(&self, settings: &PingSettings) -> f32 {
        match self {
            SettingField::Frequency => settings.frequency,
            SettingField::Range => settings.range,
            SettingField::Power => settings.power,
            SettingField::Gain => settings.gain,
            SettingField::Absorption => settings.absorption,
            SettingField::Spreading => settings.spreading,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SweepState {
    /// Setting reported by the most recent ping
    pub reference: Option<f32>,
    /// Transmit power of the most recent ping, when known
    pub power: Option<f32>,
    /// Consecutive pings that reported `reference` at `power`
    pub count: u32,
}

fn close_to(reported: Option<f32>, value: f32) -> bool {
    reported.map_or(false, |r| (r - value).abs() <= SETTING_TOLERANCE)
}

/// Counts consecutive pings reporting the same setting value.
///
/// Written by a receive loop, read by the sweep driver.
#[derive(Debug, Default)]
pub struct SweepCounter {
    field: SettingField,
    state: Mutex<SweepState>,
    changed: Condvar,
}

impl SweepCounter {
    pub fn new(field: SettingField) -> Self {
        Self {
            field,
            state: Mutex::new(SweepState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn field(&self) -> SettingField {
        self.field
    }

    fn lock(&self) -> MutexGuard<'_, SweepState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count one ping. A ping reporting a new value starts a fresh run of one.
    pub fn observe(&self, value: f32) {
        self.observe_at(value, None);
    }

    /// Count one ping that also reported its transmit power. A change in either starts a
    /// fresh run of one.
    pub fn observe_at(&self, value: f32, power: Option<f32>) {
        let mut state = self.lock();
        if state.reference == Some(value) && state.power == power {
            state.count += 1;
        } else {
            debug!(from = ?state.reference, to = value, ?power, "setting changed");
            state.reference = Some(value);
            state.power = power;
            state.count = 1;
        }
        drop(state);
        self.changed.notify_all();
    }

    pub fn observe_ping(&self, settings: &PingSettings) {
        self.observe_at(self.field.extract(settings), Some(settings.power));
    }

    pub fn state(&self) -> SweepState {
        *self.lock()
    }

    pub fn count(&self) -> u32 {
        self.lock().count
    }

    /// Zero the count, keeping the reference value
    pub fn reset(&self) {
        self.lock().count = 0;
    }

    /// Block until `count >= target` or the timeout elapses. Returns whether the target was reached.
    pub fn wait_for_count(&self, target: u32, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.count >= target)
    }

    /// Like [`Self::wait_for_count`], but only pings reporting `value` count
    pub fn wait_for_setting(&self, value: f32, target: u32, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| {
            state.count >= target && close_to(state.reference, value)
        })
    }

    /// Like [`Self::wait_for_setting`], and the pings must also report `power`
    pub fn wait_for_point(&self, power: f32, value: f32, target: u32, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| {
            state.count >= target
                && close_to(state.reference, value)
                && close_to(state.power, power)
        })
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&SweepState) -> bool) -> bool {
        let guard = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| !done(state))
            .unwrap_or_else(|e| e.into_inner());
        done(&state)
    }
}

/// The grid of settings a calibration steps through
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub powers: Vec<f32>,
    pub gains: Vec<f32>,
    pub pings_per_setting: u32,
    /// How long to wait for pings before trying again
    pub setting_timeout: Duration,
    /// Waits per setting before moving on without enough pings
    pub max_attempts: u32,
}

impl SweepPlan {
    /// Default grid for the supported sonars
    pub fn for_sonar(device: u32) -> Option<Self> {
        let (powers, gains) = match device {
            7125 => ((190..=220).step_by(5), (0..84).step_by(3)),
            7111 => ((175..=230).step_by(5), (0..83).step_by(3)),
            _ => return None,
        };
        Some(Self {
            powers: powers.map(|p| p as f32).collect(),
            gains: gains.map(|g| g as f32).collect(),
            pings_per_setting: 15,
            setting_timeout: Duration::from_secs(10),
            max_attempts: 3,
        })
    }

    /// Gain-only grid for raw element recordings. The projector stays at zero power.
    pub fn for_elements() -> Self {
        Self {
            powers: vec![0.0],
            gains: (0..84).step_by(9).map(|g| g as f32).collect(),
            pings_per_setting: 15,
            setting_timeout: Duration::from_secs(10),
            max_attempts: 3,
        }
    }

    pub fn settings(&self) -> usize {
        self.powers.len() * self.gains.len()
    }
}

/// Pulse, power, gain and ping rate a sweep starts from on each sonar
pub fn starting_commands(device: u32) -> Option<Vec<Command>> {
    let (pulse, power, gain, ping_rate) = match device {
        7125 => (100e-6, 190.0, 0.0, 10.0),
        7111 => (200e-6, 175.0, 10.0, 20.0),
        _ => return None,
    };
    Some(vec![
        Command::Pulse(pulse),
        Command::Power(power),
        Command::Gain(gain),
        Command::PingRate(ping_rate),
    ])
}

/// Settings for recording raw I&Q element data: no absorption, spreading or transmit
/// power, raw mode, and a short range. The 7111 is also limited to its 144 elements and
/// the first 220 samples.
pub fn element_commands(device: u32) -> Option<Vec<Command>> {
    let mut commands = vec![
        Command::Absorption(0.0),
        Command::Spreading(0.0),
        Command::Power(0.0),
        Command::Gain(0.0),
        Command::PingRate(10.0),
        Command::ModeType { mode: 2, method: 0 },
    ];
    match device {
        7125 => commands.push(Command::Range(10.0)),
        7111 => {
            commands.push(Command::SpecIq {
                sample_type: 16,
                first_sample: 0,
                last_sample: 220,
                elements: (0..144).collect(),
            });
            commands.push(Command::Range(100.0));
        }
        _ => return None,
    }
    Some(commands)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettingOutcome {
    pub power: f32,
    pub gain: f32,
    pub pings: u32,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub settings: Vec<SettingOutcome>,
    /// Set when the sweep was stopped before covering the whole plan
    pub interrupted: bool,
}

impl SweepReport {
    pub fn complete(&self) -> usize {
        self.settings.iter().filter(|s| s.complete).count()
    }
}

/// Step through every (power, gain) pair of `plan`, waiting at each for enough pings.
///
/// `counter` must follow [`SettingField::Gain`]. Only pings reporting both the power and
/// the gain of a setting count toward it. A setting that never collects its pings is
/// recorded as incomplete and the sweep moves on. `stop` is checked between settings.
pub fn run_sweep<L: CommandLink>(
    link: &L,
    counter: &SweepCounter,
    plan: &SweepPlan,
    stop: &AtomicBool,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let started = Instant::now();
    info!(settings = plan.settings(), "beginning sweep");
    'powers: for &power in &plan.powers {
        if stop.load(Ordering::Relaxed) {
            report.interrupted = true;
            break;
        }
        link.send_command(&Command::Power(power))?;
        for &gain in &plan.gains {
            if stop.load(Ordering::Relaxed) {
                report.interrupted = true;
                break 'powers;
            }
            counter.reset();
            link.send_command(&Command::Gain(gain))?;
            let mut complete = false;
            for attempt in 1..=plan.max_attempts {
                if counter.wait_for_point(power, gain, plan.pings_per_setting, plan.setting_timeout)
                {
                    complete = true;
                    break;
                }
                warn!(power, gain, attempt, "not enough pings at setting yet");
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            let pings = counter.count();
            info!(power, gain, pings, complete, "setting done");
            report.settings.push(SettingOutcome {
                power,
                gain,
                pings,
                complete,
            });
        }
    }
    info!(
        complete = report.complete(),
        total = plan.settings(),
        elapsed = ?started.elapsed(),
        "sweep finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_runs_of_equal_values() {
        let counter = SweepCounter::new(SettingField::Gain);
        for v in [5.0, 5.0, 5.0, 7.0, 7.0] {
            counter.observe(v);
        }
        assert_eq!(
            counter.state(),
            SweepState {
                reference: Some(7.0),
                power: None,
                count: 2
            }
        );
        counter.reset();
        assert_eq!(counter.state().reference, Some(7.0));
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn wait_returns_on_second_matching_ping() {
        let counter = Arc::new(SweepCounter::new(SettingField::Gain));
        for v in [5.0, 5.0, 5.0] {
            counter.observe(v);
        }
        counter.reset();

        let waiter = {
            let counter = counter.clone();
            thread::spawn(move || counter.wait_for_count(2, Duration::from_secs(5)))
        };
        counter.observe(7.0);
        // One ping at the new value is not enough
        assert!(!counter.wait_for_count(2, Duration::from_millis(50)));
        assert!(!waiter.is_finished());
        counter.observe(7.0);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_times_out() {
        let counter = SweepCounter::default();
        let start = Instant::now();
        assert!(!counter.wait_for_count(1, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_for_setting_ignores_other_values() {
        let counter = SweepCounter::new(SettingField::Gain);
        for _ in 0..5 {
            counter.observe(3.0);
        }
        assert!(!counter.wait_for_setting(6.0, 2, Duration::from_millis(10)));
        counter.observe(6.0);
        counter.observe(6.0);
        assert!(counter.wait_for_setting(6.0, 2, Duration::from_millis(10)));
    }

    #[test]
    fn power_change_restarts_the_run() {
        let counter = SweepCounter::new(SettingField::Gain);
        for _ in 0..3 {
            counter.observe_at(6.0, Some(190.0));
        }
        counter.observe_at(6.0, Some(200.0));
        assert_eq!(counter.count(), 1);
        assert!(!counter.wait_for_point(200.0, 6.0, 2, Duration::from_millis(10)));
        counter.observe_at(6.0, Some(200.0));
        assert!(counter.wait_for_point(200.0, 6.0, 2, Duration::from_millis(10)));
        assert!(!counter.wait_for_point(190.0, 6.0, 2, Duration::from_millis(10)));
    }

    #[test]
    fn follows_selected_field() {
        let settings = PingSettings {
            frequency: 200_000.0,
            sample_rate: 34_000.0,
            ping_period: 0.1,
            range: 50.0,
            power: 210.0,
            gain: 30.0,
            absorption: 0.0,
            spreading: 0.0,
        };
        let counter = SweepCounter::new(SettingField::Power);
        counter.observe_ping(&settings);
        assert_eq!(counter.state().reference, Some(210.0));
    }

    #[test]
    fn plans_for_known_sonars() {
        let plan = SweepPlan::for_sonar(7125).unwrap();
        assert_eq!(plan.powers.first(), Some(&190.0));
        assert_eq!(plan.powers.last(), Some(&220.0));
        assert_eq!(plan.gains.len(), 28);
        let plan = SweepPlan::for_sonar(7111).unwrap();
        assert_eq!(plan.powers.len(), 12);
        assert_eq!(plan.gains.last(), Some(&81.0));
        assert!(SweepPlan::for_sonar(7150).is_none());

        let plan = SweepPlan::for_elements();
        assert_eq!(plan.powers, vec![0.0]);
        assert_eq!(plan.gains.len(), 10);
        assert_eq!(plan.gains.last(), Some(&81.0));
        assert_eq!(plan.settings(), 10);
    }

    #[test]
    fn element_settings() {
        let commands = element_commands(7111).unwrap();
        assert!(commands.contains(&Command::ModeType { mode: 2, method: 0 }));
        assert!(commands.contains(&Command::Power(0.0)));
        match commands.iter().find(|c| matches!(c, Command::SpecIq { .. })) {
            Some(Command::SpecIq { elements, last_sample, .. }) => {
                assert_eq!(elements.len(), 144);
                assert_eq!(*last_sample, 220);
            }
            _ => panic!("7111 element setup needs specIQ"),
        }
        assert_eq!(commands.last(), Some(&Command::Range(100.0)));

        let commands = element_commands(7125).unwrap();
        assert!(!commands.iter().any(|c| matches!(c, Command::SpecIq { .. })));
        assert_eq!(commands.last(), Some(&Command::Range(10.0)));
        assert!(element_commands(7150).is_none());
    }

    #[test]
    fn starting_points() {
        let commands = starting_commands(7111).unwrap();
        assert_eq!(commands[0], Command::Pulse(200e-6));
        assert_eq!(commands[2], Command::Gain(10.0));
        assert_eq!(starting_commands(7125).unwrap()[3], Command::PingRate(10.0));
        assert!(starting_commands(7150).is_none());
    }

    /// Answers every gain command with a burst of pings at that gain and the current power
    struct PingingDevice {
        counter: Arc<SweepCounter>,
        sent: Mutex<Vec<Command>>,
        pings: u32,
        /// Power the pings report. Follows power commands unless `stuck`.
        power: Mutex<f32>,
        stuck: bool,
    }

    impl PingingDevice {
        fn new(counter: Arc<SweepCounter>, pings: u32) -> Self {
            Self {
                counter,
                sent: Mutex::new(Vec::new()),
                pings,
                power: Mutex::new(190.0),
                stuck: false,
            }
        }
    }

    impl CommandLink for PingingDevice {
        fn send_command(&self, command: &Command) -> Result<()> {
            match command {
                Command::Power(p) if !self.stuck => *self.power.lock().unwrap() = *p,
                Command::Gain(g) => {
                    let power = *self.power.lock().unwrap();
                    for _ in 0..self.pings {
                        self.counter.observe_at(*g, Some(power));
                    }
                }
                _ => {}
            }
            self.sent.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    fn small_plan() -> SweepPlan {
        SweepPlan {
            powers: vec![190.0, 200.0],
            gains: vec![0.0, 3.0, 6.0],
            pings_per_setting: 4,
            setting_timeout: Duration::from_millis(20),
            max_attempts: 2,
        }
    }

    #[test]
    fn sweep_visits_every_setting() {
        let counter = Arc::new(SweepCounter::new(SettingField::Gain));
        let device = PingingDevice::new(counter.clone(), 4);
        let report = run_sweep(&device, &counter, &small_plan(), &AtomicBool::new(false)).unwrap();
        assert_eq!(report.settings.len(), 6);
        assert_eq!(report.complete(), 6);
        assert!(!report.interrupted);
        let sent = device.sent.lock().unwrap();
        assert_eq!(sent.len(), 2 + 6);
        assert_eq!(sent[0], Command::Power(190.0));
        assert_eq!(sent[1], Command::Gain(0.0));
    }

    #[test]
    fn sweep_marks_starved_settings() {
        let counter = Arc::new(SweepCounter::new(SettingField::Gain));
        let device = PingingDevice::new(counter.clone(), 1);
        let report = run_sweep(&device, &counter, &small_plan(), &AtomicBool::new(false)).unwrap();
        assert_eq!(report.settings.len(), 6);
        assert_eq!(report.complete(), 0);
    }

    #[test]
    fn pings_at_the_old_power_do_not_count() {
        let counter = Arc::new(SweepCounter::new(SettingField::Gain));
        let mut device = PingingDevice::new(counter.clone(), 4);
        device.stuck = true;
        let plan = SweepPlan {
            gains: vec![6.0],
            ..small_plan()
        };
        let report = run_sweep(&device, &counter, &plan, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.settings.len(), 2);
        assert!(report.settings[0].complete);
        assert!(!report.settings[1].complete);
    }

    #[test]
    fn sweep_honours_stop() {
        let counter = SweepCounter::default();
        let device = PingingDevice::new(Arc::new(SweepCounter::default()), 0);
        let report = run_sweep(&device, &counter, &small_plan(), &AtomicBool::new(true)).unwrap();
        assert!(report.interrupted);
        assert!(report.settings.is_empty());
        assert!(device.sent.lock().unwrap().is_empty());
    }
}
