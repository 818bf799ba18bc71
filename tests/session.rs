use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use pdm_mic::generation::{fill_slot, PdmSource, SimulatedTransport, Waveform};
use pdm_mic::{
    Chaining, Channels, ConfigError, Decimation, DriftPolicy, Error, HardwareError, MicConfig,
    MicrophoneSession, Resource,
};

const BUFFER: usize = 128;
const SLOTS: usize = 8;
const SLOT_LEN: usize = BUFFER * 8;
const CAP: usize = SLOT_LEN * SLOTS;

type Session = MicrophoneSession<SimulatedTransport>;

fn storage(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

fn config() -> MicConfig {
    MicConfig {
        sample_rate: 16_000,
        sample_buffer_size: BUFFER,
        channels: Channels::Mono,
        decimation: Decimation::X64,
        slot_count: SLOTS,
        ..Default::default()
    }
}

fn square_source() -> PdmSource {
    PdmSource::new(Waveform::Square { high: 0.7, low: 0.3, half_period: 32 }, Decimation::X64)
}

fn next_slot(source: &mut PdmSource) -> Vec<u8> {
    let mut data = vec![0u8; SLOT_LEN];
    fill_slot(Channels::Mono, std::slice::from_mut(source), &mut data);
    data
}

/// Expected sign of the decoded square wave at output sample `n`, if clear of an edge
fn expected_sign(n: usize) -> Option<i16> {
    match n % 64 {
        4..=31 => Some(1),
        36..=63 => Some(-1),
        _ => None,
    }
}

#[test]
fn square_wave_end_to_end() {
    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new()).unwrap();
    session.start().unwrap();
    let mut source = square_source();
    let mut out = [0i16; BUFFER];

    for k in 0..24 {
        let data = next_slot(&mut source);
        assert!(SimulatedTransport::deliver(session.capture(), &data));
        assert_eq!(session.read(&mut out, BUFFER), BUFFER);
        // Nothing new until the next slot completes
        assert_eq!(session.read(&mut out, BUFFER), 0);
        if k == 0 {
            continue;
        }
        for (i, s) in out.iter().enumerate() {
            if let Some(sign) = expected_sign(k * BUFFER + i) {
                assert_eq!(s.signum(), sign, "slot {} sample {}: {}", k, i, s);
            }
        }
    }
    assert_eq!(session.capture().produced(), 24);
    assert!(!session.is_stalled());
}

#[test]
fn chained_transports_keep_order() {
    let cfg = MicConfig { chaining: Chaining::Chained, ..config() };
    let mut session = Session::new(cfg, storage(CAP), SimulatedTransport::new()).unwrap();
    assert_eq!(session.capture().transport().claimed(), 2);
    session.start().unwrap();
    assert!(session.capture().transport().is_armed(0));
    assert!(session.capture().transport().is_armed(1));

    let mut source = square_source();
    let mut out = [0i16; BUFFER];
    for k in 0..20 {
        let data = next_slot(&mut source);
        assert!(SimulatedTransport::deliver(session.capture(), &data));
        assert_eq!(session.read(&mut out, BUFFER), BUFFER);
        if k == 0 {
            continue;
        }
        for (i, s) in out.iter().enumerate() {
            if let Some(sign) = expected_sign(k * BUFFER + i) {
                assert_eq!(s.signum(), sign);
            }
        }
    }
}

fn started_session() -> Session {
    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new()).unwrap();
    session.start().unwrap();
    session
}

#[test]
fn session_can_move_while_capturing() {
    // Armed inside the helper, then moved out of it and onto the heap
    let mut session = Box::new(started_session());
    let mut source = PdmSource::new(Waveform::Constant(1.0), Decimation::X64);
    assert!(SimulatedTransport::deliver(session.capture(), &next_slot(&mut source)));

    let mut out = [0i16; BUFFER];
    assert_eq!(session.read(&mut out, BUFFER), BUFFER);
    // All ones drives the output to full scale once the filter has filled
    assert!(out[8..].iter().all(|&s| s == 32700), "{:?}", &out[..16]);
}

#[test]
fn short_output_keeps_the_slot() {
    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new()).unwrap();
    session.start().unwrap();
    let mut source = square_source();
    SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));
    let mut out = [0i16; BUFFER];
    assert_eq!(session.read(&mut out[..BUFFER / 2], BUFFER), 0);
    assert_eq!(session.read(&mut out, BUFFER), BUFFER);
}

#[test]
fn partial_requests_round_to_milliseconds() {
    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new()).unwrap();
    session.start().unwrap();
    let mut source = square_source();
    let mut out = [0i16; BUFFER];

    SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));
    assert_eq!(session.read(&mut out, 40), 32);

    // A request smaller than a millisecond still consumes the slot
    SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));
    assert_eq!(session.read(&mut out, 10), 0);
    assert_eq!(session.read(&mut out, BUFFER), 0);

    // Requests are capped at one slot
    SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));
    let mut big = [0i16; 4 * BUFFER];
    assert_eq!(session.read(&mut big, 4 * BUFFER), BUFFER);
}

#[test]
fn failed_rearm_stalls_capture() {
    // Slot 0 is armed by start, then two re-arms succeed
    let transport = SimulatedTransport::new().with_arm_budget(3);
    let mut session = Session::new(config(), storage(CAP), transport).unwrap();
    session.start().unwrap();
    let mut source = square_source();

    for _ in 0..3 {
        assert!(SimulatedTransport::deliver(session.capture(), &next_slot(&mut source)));
    }
    assert!(session.is_stalled());
    assert!(!SimulatedTransport::deliver(session.capture(), &next_slot(&mut source)));

    // The three completed slots drain, then nothing more arrives
    let mut out = [0i16; BUFFER];
    for _ in 0..3 {
        assert_eq!(session.read(&mut out, BUFFER), BUFFER);
    }
    for _ in 0..10 {
        assert_eq!(session.read(&mut out, BUFFER), 0);
    }
    assert_eq!(session.capture().produced(), 3);
}

#[test]
fn slow_reader_skips_to_fresh_data() {
    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new()).unwrap();
    session.start().unwrap();
    let mut source = square_source();
    let mut out = [0i16; BUFFER];

    // Writer gets a full lap ahead, minus one slot
    for _ in 0..SLOTS - 1 {
        SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));
    }
    let (capture, mut reader) = session.split();
    assert_eq!(reader.read(&mut out, BUFFER), BUFFER);
    assert_eq!(reader.rebases(), 1);
    assert_eq!(capture.ring().read_cursor(), SLOTS - 1);
    assert_eq!(reader.read(&mut out, BUFFER), 0);
}

#[test]
fn stop_keeps_completed_slots() {
    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new()).unwrap();
    session.start().unwrap();
    let mut source = square_source();
    SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));
    SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));

    session.stop();
    assert!(!session.capture().is_running());
    assert!(!session.capture().transport().is_listening());
    assert!(!SimulatedTransport::deliver(session.capture(), &next_slot(&mut source)));
    // Completions arriving while stopped are ignored
    session.capture().on_slot_complete(0);
    assert_eq!(session.capture().produced(), 2);

    let mut out = [0i16; BUFFER];
    assert_eq!(session.read(&mut out, BUFFER), BUFFER);
    assert_eq!(session.read(&mut out, BUFFER), BUFFER);
    assert_eq!(session.read(&mut out, BUFFER), 0);

    // Restart begins a fresh ring
    session.start().unwrap();
    assert_eq!(session.capture().produced(), 0);
    assert!(SimulatedTransport::deliver(session.capture(), &next_slot(&mut source)));
    assert_eq!(session.read(&mut out, BUFFER), BUFFER);
}

static READY: AtomicUsize = AtomicUsize::new(0);

fn on_ready() {
    READY.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn samples_ready_handler_runs_per_slot() {
    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new()).unwrap();
    session.set_samples_ready_handler(on_ready);
    session.start().unwrap();
    let mut source = square_source();
    for _ in 0..5 {
        SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));
    }
    assert_eq!(READY.load(Ordering::SeqCst), 5);
    session.capture().set_samples_ready_handler(None);
    SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));
    assert_eq!(READY.load(Ordering::SeqCst), 5);
}

#[test]
fn volume_zero_mutes() {
    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new()).unwrap();
    session.start().unwrap();
    session.set_volume(0);
    let mut source = square_source();
    let mut out = [1i16; BUFFER];
    SimulatedTransport::deliver(session.capture(), &next_slot(&mut source));
    assert_eq!(session.read(&mut out, BUFFER), BUFFER);
    assert!(out.iter().all(|&s| s == 0));
}

#[test]
fn init_errors() {
    let cfg = MicConfig { sample_buffer_size: 20, ..config() };
    assert_eq!(
        Session::new(cfg, storage(CAP), SimulatedTransport::new()).err(),
        Some(Error::Config(ConfigError::BufferNotMultipleOfMs { buffer_size: 20, samples_per_ms: 16 }))
    );

    let cfg = MicConfig { slot_count: 16, ..config() };
    assert_eq!(
        Session::new(cfg, storage(CAP), SimulatedTransport::new()).err(),
        Some(Error::ResourceExhaustion(Resource::Storage { needed: 2 * CAP, available: CAP }))
    );

    let cfg = MicConfig { chaining: Chaining::Chained, ..config() };
    assert_eq!(
        Session::new(cfg, storage(CAP), SimulatedTransport::with_channels(1)).err(),
        Some(Error::ResourceExhaustion(Resource::TransportChannel))
    );
}

#[test]
fn start_errors_leave_session_stopped() {
    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new().without_notification()).unwrap();
    assert_eq!(session.start(), Err(Error::Hardware(HardwareError::Notification)));
    assert!(!session.capture().is_running());

    let mut session = Session::new(config(), storage(CAP), SimulatedTransport::new().with_arm_budget(0)).unwrap();
    assert_eq!(session.start(), Err(Error::Hardware(HardwareError::Arm)));
    assert!(!session.capture().is_running());
    assert!(!session.capture().transport().is_listening());
}

#[test]
fn threaded_producer_and_reader() {
    let cfg = MicConfig { drift: DriftPolicy::Measured, ..config() };
    let mut session = Session::new(cfg, storage(CAP), SimulatedTransport::new()).unwrap();
    session.start().unwrap();
    let (capture, mut reader) = session.split();

    let total = 200;
    let done = AtomicBool::new(false);
    let mut decoded = 0;
    std::thread::scope(|s| {
        s.spawn(|| {
            let mut source = square_source();
            for _ in 0..total {
                let data = next_slot(&mut source);
                assert!(SimulatedTransport::deliver(capture, &data));
                std::thread::sleep(Duration::from_micros(200));
            }
            done.store(true, Ordering::Release);
        });

        let mut out = [0i16; BUFFER];
        while !done.load(Ordering::Acquire) {
            match reader.read(&mut out, BUFFER) {
                0 => std::thread::yield_now(),
                n => {
                    assert_eq!(n, BUFFER);
                    decoded += 1;
                }
            }
        }
    });
    assert!(decoded > 0);
    assert_eq!(capture.produced(), total);
    assert!(!capture.is_stalled());
}
