//! Human input controllers: joysticks, gamepads and the like.
//!
//! Devices are read through the Linux joystick interface (`/dev/input/js*`).
//! Each device gets a reader thread that folds its events into the latest
//! [`Sample`]. Index 0 is always the virtual `null` controller whose channels
//! read as zero and false.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

/// Name of the virtual controller at index 0.
pub const NULL_CONTROLLER_NAME: &str = "null";

const DEVICE_DIR: &str = "/dev/input";
const EVENT_SIZE: usize = 8;
const EVENT_BUTTON: u8 = 0x01;
const EVENT_AXIS: u8 = 0x02;
const EVENT_INIT: u8 = 0x80;

/// State of all channels of a controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    /// Analog axes normalized to [-1, +1].
    pub axis: BTreeMap<u8, f64>,
    /// Push buttons, true while held down.
    pub button: BTreeMap<u8, bool>,
    /// Toggle switches, flipped by every press of the same-numbered button.
    pub toggle: BTreeMap<u8, bool>,
}

impl Sample {
    /// Axis value; unknown channels read zero.
    #[must_use]
    pub fn axis(&self, index: u8) -> f64 {
        self.axis.get(&index).copied().unwrap_or(0.0)
    }

    /// Button state; unknown channels read false.
    #[must_use]
    pub fn button(&self, index: u8) -> bool {
        self.button.get(&index).copied().unwrap_or(false)
    }

    /// Toggle state; unknown channels read false.
    #[must_use]
    pub fn toggle(&self, index: u8) -> bool {
        self.toggle.get(&index).copied().unwrap_or(false)
    }
}

/// A raw joystick event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Event kind bits.
    pub kind: u8,
    /// Channel number.
    pub number: u8,
    /// Raw value.
    pub value: i16,
}

impl Event {
    /// Decodes the kernel's `struct js_event`: time (u32), value (i16), type, number.
    #[must_use]
    pub fn decode(raw: [u8; EVENT_SIZE]) -> Self {
        Self {
            value: i16::from_ne_bytes([raw[4], raw[5]]),
            kind: raw[6],
            number: raw[7],
        }
    }

    /// Folds the event into `sample`.
    pub fn apply(self, sample: &mut Sample) {
        let initial = self.kind & EVENT_INIT != 0;
        match self.kind & !EVENT_INIT {
            EVENT_AXIS => {
                let x = (f64::from(self.value) / f64::from(i16::MAX)).clamp(-1.0, 1.0);
                let _ = sample.axis.insert(self.number, x);
            }
            EVENT_BUTTON => {
                let pressed = self.value != 0;
                let _ = sample.button.insert(self.number, pressed);
                let toggle = sample.toggle.entry(self.number).or_insert(false);
                if pressed && !initial {
                    *toggle = !*toggle;
                }
            }
            _ => {}
        }
    }
}

/// Something that can be sampled.
pub trait Controller: Send + Sync {
    /// Human-readable name.
    fn name(&self) -> &str;
    /// The latest state.
    fn sample(&self) -> Sample;
    /// Number of events seen so far; grows whenever the state may have changed.
    fn updates(&self) -> u64 {
        0
    }
}

/// The always-present controller without channels.
#[derive(Debug, Default)]
pub struct NullController;

impl Controller for NullController {
    fn name(&self) -> &str {
        NULL_CONTROLLER_NAME
    }

    fn sample(&self) -> Sample {
        Sample::default()
    }
}

/// A device under `/dev/input` read by a background thread.
#[derive(Debug)]
pub struct Joystick {
    name: String,
    state: Arc<Mutex<Sample>>,
    updates: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
}

fn device_name(path: &Path) -> Option<String> {
    let file = path.file_name()?.to_str()?;
    let sys = PathBuf::from("/sys/class/input").join(file).join("device/name");
    std::fs::read_to_string(sys).ok().map(|s| s.trim().to_owned())
}

impl Joystick {
    /// Opens the device and starts reading it.
    ///
    /// # Errors
    ///
    /// Fails if the device cannot be opened.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let name = device_name(path).unwrap_or_else(|| path.display().to_string());
        let state = Arc::new(Mutex::new(Sample::default()));
        let updates = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = (Arc::clone(&state), Arc::clone(&updates), Arc::clone(&stop));
        let label = name.clone();
        let _ = thread::Builder::new()
            .name(format!("joystick {label}"))
            .spawn(move || read_events(file, &label, &worker.0, &worker.1, &worker.2))?;
        tracing::info!(device = %path.display(), name = %name, "controller opened");
        Ok(Self {
            name,
            state,
            updates,
            stop,
        })
    }
}

// The read blocks until the next event, so a stopped reader lingers until then.
fn read_events(mut file: File, name: &str, state: &Mutex<Sample>, updates: &AtomicU64, stop: &AtomicBool) {
    let mut raw = [0_u8; EVENT_SIZE];
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = file.read_exact(&mut raw) {
            tracing::warn!(controller = name, error = %e, "controller disconnected");
            return;
        }
        let event = Event::decode(raw);
        event.apply(&mut state.lock().unwrap_or_else(PoisonError::into_inner));
        let _ = updates.fetch_add(1, Ordering::Relaxed);
    }
}

impl Controller for Joystick {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample(&self) -> Sample {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl Drop for Joystick {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn joystick_number(name: &str) -> Option<u32> {
    name.strip_prefix("js")?.parse().ok()
}

/// Paths of the joystick devices in index order.
#[must_use]
pub fn joystick_devices(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<(u32, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|e| joystick_number(e.file_name().to_str()?).map(|n| (n, e.path())))
        .collect();
    found.sort();
    found.into_iter().map(|(_, p)| p).collect()
}

/// All controllers: `null` first, then every joystick that could be opened.
#[must_use]
pub fn list_controllers() -> Vec<Box<dyn Controller>> {
    let mut out: Vec<Box<dyn Controller>> = vec![Box::new(NullController)];
    for path in joystick_devices(Path::new(DEVICE_DIR)) {
        match Joystick::open(&path) {
            Ok(j) => out.push(Box::new(j)),
            Err(e) => tracing::warn!(device = %path.display(), error = %e, "cannot open controller"),
        }
    }
    out
}

/// Refers to a controller by index or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Position in [`list_controllers`].
    Index(usize),
    /// Exact name.
    Name(String),
}

/// Controllers whose samples are captured together once per cycle so that
/// all expressions of a cycle see the same state.
pub struct ControllerReader {
    controllers: Vec<Box<dyn Controller>>,
    held: Mutex<Vec<Sample>>,
}

impl std::fmt::Debug for ControllerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.controllers.iter().map(|c| c.name()).collect();
        f.debug_struct("ControllerReader").field("controllers", &names).finish()
    }
}

impl ControllerReader {
    /// A reader over `controllers`, sampled once immediately.
    #[must_use]
    pub fn new(controllers: Vec<Box<dyn Controller>>) -> Self {
        let reader = Self {
            controllers,
            held: Mutex::new(Vec::new()),
        };
        reader.sample_and_hold();
        reader
    }

    /// A reader over all connected controllers.
    #[must_use]
    pub fn open() -> Self {
        let started = std::time::Instant::now();
        let reader = Self::new(list_controllers());
        tracing::debug!(?reader, elapsed = ?started.elapsed(), "controller reader constructed");
        reader
    }

    /// Captures the state of every controller.
    pub fn sample_and_hold(&self) {
        let samples = self.controllers.iter().map(|c| c.sample()).collect();
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = samples;
    }

    /// The held sample of the selected controller; `None` if there is no such controller.
    #[must_use]
    pub fn read(&self, selector: &Selector) -> Option<Sample> {
        let index = match selector {
            Selector::Index(i) => *i,
            Selector::Name(name) => self.controllers.iter().position(|c| c.name() == name)?,
        };
        self.held.lock().unwrap_or_else(PoisonError::into_inner).get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(value: i16, kind: u8, number: u8) -> [u8; EVENT_SIZE] {
        let v = value.to_ne_bytes();
        [0, 0, 0, 0, v[0], v[1], kind, number]
    }

    struct Fixed(Sample);

    impl Controller for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn sample(&self) -> Sample {
            self.0.clone()
        }
    }

    #[test]
    fn events_update_axes_buttons_and_toggles() {
        let mut s = Sample::default();
        Event::decode(raw(0, EVENT_BUTTON | EVENT_INIT, 3)).apply(&mut s);
        assert_eq!((s.button(3), s.toggle(3)), (false, false));
        Event::decode(raw(1, EVENT_BUTTON, 3)).apply(&mut s);
        assert_eq!((s.button(3), s.toggle(3)), (true, true));
        Event::decode(raw(0, EVENT_BUTTON, 3)).apply(&mut s);
        assert_eq!((s.button(3), s.toggle(3)), (false, true));
        Event::decode(raw(1, EVENT_BUTTON, 3)).apply(&mut s);
        assert!(!s.toggle(3));

        Event::decode(raw(i16::MAX, EVENT_AXIS, 0)).apply(&mut s);
        Event::decode(raw(i16::MIN, EVENT_AXIS, 1)).apply(&mut s);
        assert!((s.axis(0) - 1.0).abs() < 1e-9);
        assert!((s.axis(1) + 1.0).abs() < 1e-9);
        assert!(s.axis(9).abs() < f64::EPSILON);
    }

    #[test]
    fn reader_selects_by_index_and_name() {
        let mut sample = Sample::default();
        let _ = sample.axis.insert(2, 0.5);
        let reader = ControllerReader::new(vec![Box::new(NullController), Box::new(Fixed(sample))]);
        assert_eq!(reader.read(&Selector::Index(0)), Some(Sample::default()));
        let fixed = reader.read(&Selector::Name("fixed".into())).expect("by name");
        assert!((fixed.axis(2) - 0.5).abs() < 1e-9);
        assert_eq!(reader.read(&Selector::Index(5)), None);
        assert_eq!(reader.read(&Selector::Name("nope".into())), None);
    }

    #[test]
    fn device_listing_is_ordered_by_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["js10", "js2", "event0", "jsx"] {
            std::fs::write(dir.path().join(name), b"").expect("write");
        }
        let found: Vec<_> = joystick_devices(dir.path())
            .iter()
            .map(|p| p.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_owned())
            .collect();
        assert_eq!(found, ["js2", "js10"]);
    }
}
