//! End-to-end mixer scenarios against the offline driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use pv_mixer::{
    BlockState, DemandFeedFn, Fx16, LoopRegion, MIX_BUFFER_SAMPLES, MUSIC_PRIORITY, Mixer,
    MixerConfig, MixerError, NullDriver, NullPump, Playback, PrefetchTask, SampleSource,
    VoiceParams,
};

fn init_mixer(max_voices: usize) -> (Mixer, NullPump) {
    let (driver, pump) = NullDriver::new();
    let config = MixerConfig { mix_rate: 44100, max_voices, channels: 2 };
    let mixer = Mixer::init(Box::new(driver), config).unwrap();
    (mixer, pump)
}

fn render(pump: &NullPump) -> Vec<i16> {
    let mut page = vec![0i16; pump.page_samples().unwrap()];
    assert!(pump.render(&mut page));
    page
}

fn pcm16(samples: &[i16]) -> Arc<[u8]> {
    samples
        .iter()
        .flat_map(|s| s.to_ne_bytes())
        .collect::<Vec<_>>()
        .into()
}

fn mono16_params(rate: u32) -> VoiceParams {
    VoiceParams { bits: 16, channels: 1, rate, ..VoiceParams::default() }
}

#[test]
fn test_init_idle_shutdown() {
    let (mixer, pump) = init_mixer(8);
    assert_eq!(mixer.voices_playing(), 0);

    let page = render(&pump);
    assert!(page.iter().all(|&s| s == 0));

    mixer.shutdown();
    assert_eq!(mixer.voices_playing(), 0);
    assert_eq!(mixer.volume(), Err(MixerError::NotInstalled));
    assert!(!pump.render(&mut [0i16; 16]));
}

#[test]
fn test_shutdown_then_init_is_fresh() {
    let (mixer, _pump) = init_mixer(8);
    let data = pcm16(&[1000; 4096]);
    for _ in 0..4 {
        mixer.play_raw(Arc::clone(&data), &mono16_params(44100)).unwrap();
    }
    mixer.shutdown();

    let (mixer, pump) = init_mixer(8);
    assert_eq!(mixer.voices_playing(), 0);
    for _ in 0..8 {
        mixer.play_raw(Arc::clone(&data), &mono16_params(44100)).unwrap();
    }
    assert_eq!(mixer.voices_playing(), 8);
    let page = render(&pump);
    assert!(page.iter().any(|&s| s != 0));
}

#[test]
fn test_demand_feed_square_wave_centered() {
    let (mixer, pump) = init_mixer(8);

    // ~1 kHz square at 22050 Hz, produced in 512-frame blocks.
    let mut phase = 0u32;
    let feed: DemandFeedFn = Box::new(move || {
        let mut samples = Vec::with_capacity(512);
        for _ in 0..512 {
            samples.push(if (phase / 11) % 2 == 0 { 8000i16 } else { -8000 });
            phase += 1;
        }
        Some(pcm16(&samples))
    });

    let handle = mixer.play_demand_feed(feed, &mono16_params(22050)).unwrap();
    assert!(mixer.voice_playing(handle));

    let mut page = Vec::new();
    for _ in 0..4 {
        page = render(&pump);
    }

    assert!(page.iter().any(|&s| s != 0));
    // Centered pan drives both channels identically.
    for frame in page.chunks_exact(2) {
        assert_eq!(frame[0], frame[1]);
    }
}

#[test]
fn test_full_pool_eviction_and_callback() {
    let (mixer, _pump) = init_mixer(8);
    let killed: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&killed);
    mixer
        .on_voice_done(Some(Box::new(move |token| sink.lock().push(token))))
        .unwrap();

    let data = pcm16(&[2000; 4096]);
    for token in 1..=8u64 {
        let params = VoiceParams {
            priority: 1,
            callback_val: token,
            ..mono16_params(44100)
        };
        mixer.play_raw(Arc::clone(&data), &params).unwrap();
    }
    assert_eq!(mixer.voices_playing(), 8);
    assert!(!mixer.voice_available(0));
    assert!(mixer.voice_available(1));

    // Lower priority cannot evict anyone.
    let refused = mixer.play_raw(
        Arc::clone(&data),
        &VoiceParams { priority: 0, ..mono16_params(44100) },
    );
    assert_eq!(refused, Err(MixerError::NoVoices));
    assert!(killed.lock().is_empty());

    // Higher priority evicts the oldest priority-1 voice.
    let params = VoiceParams { priority: 2, callback_val: 99, ..mono16_params(44100) };
    mixer.play_raw(Arc::clone(&data), &params).unwrap();
    assert_eq!(mixer.voices_playing(), 8);
    assert_eq!(killed.lock().as_slice(), &[1]);
}

#[test]
fn test_music_voice_sums_with_callback() {
    let (mixer, pump) = init_mixer(8);

    mixer
        .hook_music_routine(Box::new(|buffer: &mut [i16]| buffer.fill(100)))
        .unwrap();

    let data = pcm16(&[5000; 2048]);
    let params = VoiceParams { priority: MUSIC_PRIORITY, ..mono16_params(44100) };
    mixer.play_raw(data, &params).unwrap();

    // The music channel ignores the global gain.
    mixer.set_volume(64).unwrap();

    let page = render(&pump);
    assert!(page.iter().all(|&s| s == 5100));

    // Without the voice, the callback alone remains.
    mixer.kill_all_voices(false).unwrap();
    assert_eq!(mixer.voices_playing(), 1);
    mixer.unhook_music_routine().unwrap();
}

#[test]
fn test_reverb_impulse_echoes_after_delay() {
    let (mixer, pump) = init_mixer(8);
    mixer.set_reverb(128).unwrap();
    mixer.set_reverb_delay(512).unwrap();

    // A single full-gain impulse frame.
    mixer.play_raw(pcm16(&[20000]), &mono16_params(44100)).unwrap();

    let first = render(&pump);
    assert_eq!(first[0], 20000);
    assert_eq!(first[1], 20000);
    assert!(first[2..].iter().all(|&s| s == 0));

    let second = render(&pump);
    assert!(second.iter().all(|&s| s == 0));

    // 512 samples after the impulse, its attenuated copy returns.
    let third = render(&pump);
    let expected = Fx16::from_ratio(128, 255).scale(20000) as i16;
    assert_eq!(third[0], expected);
    assert_eq!(third[1], expected);
    assert!(third[2..].iter().all(|&s| s == 0));
}

#[test]
fn test_reverb_delay_clamps() {
    let (mixer, _pump) = init_mixer(8);
    let max = mixer.max_reverb_delay().unwrap();

    mixer.set_reverb_delay(1).unwrap();
    assert_eq!(mixer.reverb_delay().unwrap(), MIX_BUFFER_SAMPLES);

    mixer.set_reverb_delay(usize::MAX).unwrap();
    assert_eq!(mixer.reverb_delay().unwrap(), max);
}

#[test]
fn test_pause_freezes_position() {
    let (mixer, pump) = init_mixer(8);
    let data = pcm16(&[3000; 44100]);
    let handle = mixer.play_raw(data, &mono16_params(44100)).unwrap();

    mixer.pause_voice(handle, true).unwrap();
    assert!(!mixer.voice_playing(handle));
    assert_eq!(mixer.voices_playing(), 1);

    for _ in 0..10 {
        let page = render(&pump);
        assert!(page.iter().all(|&s| s == 0));
    }
    assert_eq!(mixer.position(handle).unwrap(), 0);

    mixer.pause_voice(handle, false).unwrap();
    assert!(mixer.voice_playing(handle));
    assert_eq!(mixer.voices_playing(), 1);

    let page = render(&pump);
    assert!(page.iter().any(|&s| s != 0));
    assert!(mixer.position(handle).unwrap() > 0);
}

#[test]
fn test_seek_round_trip() {
    let (mixer, _pump) = init_mixer(8);
    let data = pcm16(&[700; 4096]);
    let handle = mixer.play_raw(data, &mono16_params(44100)).unwrap();

    mixer.set_position(handle, 400).unwrap();
    assert_eq!(mixer.position(handle).unwrap(), 400);

    mixer.set_position(handle, 0).unwrap();
    assert_eq!(mixer.position(handle).unwrap(), 0);
}

#[test]
fn test_looped_voice_survives_until_loop_ends() {
    let (mixer, pump) = init_mixer(8);
    let done = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&done);
    mixer
        .on_voice_done(Some(Box::new(move |token| sink.lock().push(token))))
        .unwrap();

    // 64 frames of data, looping over the last 32: far less than a page,
    // so a single render crosses the loop many times.
    let params = VoiceParams { callback_val: 7, ..mono16_params(44100) };
    let handle = mixer
        .play_raw_looped(
            pcm16(&[4000; 64]),
            &params,
            LoopRegion { start: 32, frames: 32 },
        )
        .unwrap();

    let page = render(&pump);
    assert!(page.iter().all(|&s| s == 4000));
    assert!(mixer.voice_playing(handle));

    mixer.end_looping(handle).unwrap();
    while mixer.voice_playing(handle) {
        render(&pump);
    }
    assert_eq!(done.lock().as_slice(), &[7]);
}

#[test]
fn test_stale_handle_is_not_found() {
    let (mixer, pump) = init_mixer(8);
    let handle = mixer.play_raw(pcm16(&[100]), &mono16_params(44100)).unwrap();

    render(&pump); // one frame of data; the voice ends immediately
    assert!(!mixer.voice_playing(handle));
    assert_eq!(mixer.set_pan(handle, 255, 255, 255), Err(MixerError::VoiceNotFound));
    assert_eq!(mixer.position(handle), Err(MixerError::VoiceNotFound));
    assert_eq!(mixer.kill(handle), Err(MixerError::VoiceNotFound));
}

#[test]
fn test_kill_all_spares_music_voice() {
    let (mixer, _pump) = init_mixer(8);
    let data = pcm16(&[1000; 4096]);

    for _ in 0..3 {
        mixer.play_raw(Arc::clone(&data), &mono16_params(44100)).unwrap();
    }
    let music = VoiceParams { priority: MUSIC_PRIORITY, ..mono16_params(44100) };
    let music_handle = mixer.play_raw(Arc::clone(&data), &music).unwrap();

    mixer.kill_all_voices(false).unwrap();
    assert_eq!(mixer.voices_playing(), 1);
    assert!(mixer.voice_playing(music_handle));

    mixer.kill(music_handle).unwrap();
    assert_eq!(mixer.voices_playing(), 0);
}

#[test]
fn test_pitch_changes_consumption_rate() {
    let (mixer, pump) = init_mixer(8);
    let data = pcm16(&[2500; 8192]);

    let handle = mixer.play_raw(Arc::clone(&data), &mono16_params(44100)).unwrap();
    render(&pump);
    let baseline = mixer.position(handle).unwrap();
    assert_eq!(baseline, MIX_BUFFER_SAMPLES as u32 * 2);

    // One octave down halves the read rate.
    mixer.set_pitch(handle, -1200).unwrap();
    render(&pump);
    let slowed = mixer.position(handle).unwrap() - baseline;
    assert_eq!(slowed, MIX_BUFFER_SAMPLES as u32);

    // An explicit frequency override behaves the same way.
    mixer.set_frequency(handle, 11025).unwrap();
    assert_eq!(mixer.frequency(handle).unwrap(), 11025);
}

struct PrefetchingSource {
    inner: pv_mixer::RawSource,
    task: Option<PrefetchTask>,
}

impl SampleSource for PrefetchingSource {
    fn refill(&mut self, block: &mut BlockState) -> Playback {
        self.inner.refill(block)
    }

    fn bytes(&self) -> &[u8] {
        self.inner.bytes()
    }

    fn prefetch(&mut self) -> Option<PrefetchTask> {
        self.task.take()
    }
}

#[test]
fn test_control_waits_for_prefetch_task() {
    let (mixer, pump) = init_mixer(8);

    let (sender, task) = PrefetchTask::channel();
    let source = PrefetchingSource {
        inner: pv_mixer::RawSource::new(pcm16(&[6000; 4096]), 16, 1, None).unwrap(),
        task: Some(task),
    };
    let handle = mixer.play_source(Box::new(source), &mono16_params(44100)).unwrap();

    // While the decode is in flight, service skips the voice.
    let page = render(&pump);
    assert!(page.iter().all(|&s| s == 0));

    let resolved = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&resolved);
    let decoder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        flag.store(true, Ordering::Release);
        sender.send(Ok(())).unwrap();
    });

    // This control call blocks until the decoder delivers.
    mixer.set_pan(handle, 255, 255, 255).unwrap();
    assert!(resolved.load(Ordering::Acquire));
    decoder.join().unwrap();

    let page = render(&pump);
    assert!(page.iter().any(|&s| s != 0));
}

#[test]
fn test_failed_prefetch_ends_voice() {
    let (mixer, pump) = init_mixer(8);
    let done = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&done);
    mixer
        .on_voice_done(Some(Box::new(move |token| sink.lock().push(token))))
        .unwrap();

    let (sender, task) = PrefetchTask::channel();
    let source = PrefetchingSource {
        inner: pv_mixer::RawSource::new(pcm16(&[6000; 64]), 16, 1, None).unwrap(),
        task: Some(task),
    };
    let params = VoiceParams { callback_val: 13, ..mono16_params(44100) };
    let handle = mixer.play_source(Box::new(source), &params).unwrap();

    sender.send(Err(MixerError::InvalidFile)).unwrap();
    let page = render(&pump);
    assert!(page.iter().all(|&s| s == 0));
    assert!(!mixer.voice_playing(handle));
    assert_eq!(done.lock().as_slice(), &[13]);
}

#[test]
fn test_global_volume_round_trip_and_scaling() {
    let (mixer, pump) = init_mixer(8);

    mixer.set_volume(128).unwrap();
    assert_eq!(mixer.volume().unwrap(), 128);

    mixer.play_raw(pcm16(&[10000; 4096]), &mono16_params(44100)).unwrap();
    let page = render(&pump);
    let expected = Fx16::from_ratio(128, 255).scale(10000) as i16;
    assert!(page.iter().all(|&s| (s - expected).abs() <= 1));
}

#[test]
fn test_pan_hard_left_silences_right() {
    let (mixer, pump) = init_mixer(8);
    let handle = mixer.play_raw(pcm16(&[9000; 16384]), &mono16_params(44100)).unwrap();
    mixer.set_pan(handle, 255, 255, 0).unwrap();

    // The gain change was made before the first page, but smoothing still
    // ramps from the initial centered gains; ~30 ms reaches 90%, so give
    // it a couple hundred milliseconds to land.
    let mut page = Vec::new();
    for _ in 0..32 {
        page = render(&pump);
    }

    let (left, right) = (page[page.len() - 2], page[page.len() - 1]);
    assert!(left > 8000);
    assert_eq!(right, 0);
}
