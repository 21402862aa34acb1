// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Time rectifier: feeds downstream modules with a clean signal.
//!
//! A clean signal has continuous timings (no gaps, overlaps or
//! discontinuities, though it need not start at zero) and synchronized
//! media. The module is sample accurate and operates on raw data.
//!
//! It works by ticking at the configured output framerate:
//! - at each tick it pulls the queued input data, like a mux would;
//! - clock times drive everything; input media times are considered
//!   unreliable and only used to synchronize the input streams against
//!   each other;
//! - the video stream leads (master), audio is pulled by sample interval,
//!   sparse streams ride along.
//!
//! It also acts as a framerate converter for video: frames are repeated or
//! skipped as the tick rate demands, and output times are exact fractions
//! of the tick index, so rational rate changes do not drift.

use castflow_core::clock::{fraction_to_clock, Clock, CLOCK_RATE};
use castflow_core::data::{Packet, PcmFormat, PcmFrame};
use castflow_core::error::{CastflowError, Result};
use castflow_core::fraction::Fraction;
use castflow_core::helpers::config_helpers;
use castflow_core::metadata::StreamKind;
use castflow_core::module::{Host, LogLevel, Module, PortSet};
use castflow_core::ports::{InputPort, OutputPort};
use castflow_core::scheduler::{Scheduler, SystemScheduler, TaskId};
use castflow_core::{async_trait, ModuleRegistry, SystemClock};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

/// Input records older than this are dropped at each tick (at least one is
/// always kept).
const ANALYZE_WINDOW_IN_180K: i64 = CLOCK_RATE * 500 / 1000;

/// Raw data is large; the output pools are sized for the analyze window,
/// not for throughput.
const RECTIFIER_POOL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TimeRectifierConfig {
    /// Output framerate numerator/denominator.
    pub framerate_num: i64,
    pub framerate_den: i64,
}

impl Default for TimeRectifierConfig {
    fn default() -> Self {
        Self { framerate_num: 25, framerate_den: 1 }
    }
}

struct Rec {
    creation_time: i64,
    pkt: Packet,
}

struct Stream {
    input: Arc<InputPort>,
    output: Arc<OutputPort>,
    queue: Vec<Rec>,
    /// When the input has nothing for a tick, repeat this instead.
    blank: Option<Packet>,
    fmt: Option<PcmFormat>,
}

struct State {
    streams: Vec<Stream>,
    num_ticks: i64,
    pending: Option<TaskId>,
    stopped: bool,
    has_video: bool,
    /// Consecutive ticks spent without a video reference stream.
    no_video_ticks: i64,
    /// The grace window ran out without a video stream appearing.
    video_timeout: bool,
}

struct Shared {
    host: Arc<dyn Host>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    frame_period: Fraction,
    /// Phase-jitter latency: a master frame younger than this stays queued
    /// and is reused next tick. Protects against frame phase changes.
    threshold: i64,
    /// A video master is required; its absence is tolerated for one
    /// analyze window of ticks before the module fails.
    no_video_tick_limit: i64,
    /// Serializes tick bodies: all outputs of tick `n` are posted before
    /// any packet of tick `n+1`.
    tick_guard: AsyncMutex<()>,
    state: StdMutex<State>,
}

/// Sample-accurate multi-stream resynchronizer and framerate converter.
/// One output mirrors each input; the single raw-video input is the master.
pub struct TimeRectifier {
    ports: PortSet,
    shared: Arc<Shared>,
}

impl TimeRectifier {
    pub fn new(
        host: Arc<dyn Host>,
        cfg: &TimeRectifierConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Box<dyn Module> {
        let frame_period = Fraction::new(cfg.framerate_den, cfg.framerate_num);
        let threshold = fraction_to_clock(frame_period);
        let no_video_tick_limit = ANALYZE_WINDOW_IN_180K / threshold.max(1) + 1;
        Box::new(Self {
            ports: PortSet::new(),
            shared: Arc::new(Shared {
                host,
                clock,
                scheduler,
                frame_period,
                threshold,
                no_video_tick_limit,
                tick_guard: AsyncMutex::new(()),
                state: StdMutex::new(State {
                    streams: Vec::new(),
                    num_ticks: 0,
                    pending: None,
                    stopped: false,
                    has_video: false,
                    no_video_ticks: 0,
                    video_timeout: false,
                }),
            }),
        })
    }

    pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
        registry.register_with_description(
            "time_rectifier",
            serde_json::to_value(schemars::schema_for!(TimeRectifierConfig)).unwrap_or_default(),
            "Sample-accurate resynchronization and framerate conversion",
            |host, params| {
                let cfg: TimeRectifierConfig = config_helpers::parse_config_optional(params)?;
                let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
                let scheduler: Arc<dyn Scheduler> = Arc::new(SystemScheduler::new(clock.clone()));
                Ok(Self::new(host, &cfg, clock, scheduler))
            },
        )
    }
}

fn schedule_tick(shared: &Arc<Shared>, when: Fraction) -> TaskId {
    let sh = shared.clone();
    shared.scheduler.schedule_at(Box::new(move |t| Box::pin(async move { Shared::on_period(sh, t).await })), when)
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn on_period(shared: Arc<Self>, now: Fraction) {
        {
            let mut st = shared.lock();
            st.pending = None;
        }
        {
            let _tick = shared.tick_guard.lock().await;
            shared.emit_one_period(now).await;
        }
        let mut st = shared.lock();
        if !st.stopped {
            let next = now + shared.frame_period;
            st.pending = Some(schedule_tick(&shared, next));
        }
    }

    /// Move everything queued on the input ports into the per-stream
    /// records, stamped with the current clock time.
    fn fill_input_queues(&self, now_ticks: i64) {
        let mut st = self.lock();
        let mut video_streams = 0;
        for stream in &mut st.streams {
            while let Some(pkt) = stream.input.try_pop() {
                match stream.input.update_metadata(&pkt) {
                    Ok(true) => {
                        if let Some(meta) = stream.input.metadata() {
                            stream.output.set_metadata(meta);
                        }
                    },
                    Ok(false) => {},
                    Err(e) => {
                        self.host.log(LogLevel::Error, &format!("dropping packet: {e}"));
                        continue;
                    },
                }
                stream.queue.push(Rec { creation_time: now_ticks, pkt });
            }
            if stream.input.metadata().is_some_and(|m| m.kind() == StreamKind::VideoRaw) {
                video_streams += 1;
            }
        }
        if video_streams > 1 {
            self.host.log(LogLevel::Error, "only one video stream is allowed");
        }
        st.has_video = video_streams >= 1;
    }

    fn discard_outdated(&self, removal_clock_time: i64) {
        let mut st = self.lock();
        for stream in &mut st.streams {
            while stream.queue.len() > 1 && stream.queue[0].creation_time < removal_clock_time {
                let dropped = stream.queue.remove(0);
                self.host.log(
                    LogLevel::Debug,
                    &format!(
                        "remove outdated data media={} clock={} (removal={removal_clock_time})",
                        dropped.pkt.media_time().unwrap_or(0),
                        dropped.creation_time
                    ),
                );
            }
        }
    }

    /// Pick the master frame: the queue head, unless it is younger than one
    /// frame period (then it stays queued and is used again next tick), or
    /// the queue is empty (then the last seen frame is repeated).
    fn choose_next_master(stream: &mut Stream, now_ticks: i64, threshold: i64) -> Option<Packet> {
        if stream.queue.is_empty() {
            return stream.blank.clone();
        }
        stream.blank = Some(stream.queue[0].pkt.clone());
        if (stream.queue[0].creation_time - now_ticks).abs() < threshold {
            return stream.blank.clone();
        }
        let rec = stream.queue.remove(0);
        Some(rec.pkt)
    }

    // Post one media period on all outputs.
    //
    // "in" media times are the media times of the input samples. They may
    // contain gaps and offsets, so they are only used for synchronization
    // between input streams. "out" media times are the media times of the
    // output samples: perfectly continuous, increasing, and independent of
    // the input framing.
    async fn emit_one_period(&self, now: Fraction) {
        let now_ticks = fraction_to_clock(now);
        self.fill_input_queues(now_ticks);
        self.discard_outdated(now_ticks - ANALYZE_WINDOW_IN_180K);

        // the video master is required; tolerate its absence for one
        // analyze window of ticks, then stop and fail rather than warn
        // forever
        {
            let mut st = self.lock();
            if st.has_video {
                st.no_video_ticks = 0;
            } else {
                st.no_video_ticks += 1;
                if st.no_video_ticks > self.no_video_tick_limit {
                    st.stopped = true;
                    st.video_timeout = true;
                    drop(st);
                    self.host.log(LogLevel::Error, "requires to have one video stream connected");
                } else {
                    drop(st);
                    self.host.log(LogLevel::Warning, "no video reference stream connected yet");
                }
                return;
            }
        }

        let out_start =
            fraction_to_clock(Fraction::new(self.lock().num_ticks * self.frame_period.num, self.frame_period.den));
        let out_stop = fraction_to_clock(Fraction::new(
            (self.lock().num_ticks + 1) * self.frame_period.num,
            self.frame_period.den,
        ));

        // master selection
        let (master_idx, master_pkt, master_output) = {
            let mut st = self.lock();
            let Some(idx) = st
                .streams
                .iter()
                .position(|s| s.input.metadata().is_some_and(|m| m.kind() == StreamKind::VideoRaw))
            else {
                return;
            };
            let first_tick = st.num_ticks == 0;
            let threshold = self.threshold;
            let stream = &mut st.streams[idx];
            let Some(pkt) = Self::choose_next_master(stream, now_ticks, threshold) else {
                self.host
                    .log(LogLevel::Warning, &format!("no available reference data for clock time {now_ticks}"));
                return;
            };
            if first_tick {
                self.host.log(LogLevel::Info, &format!("first available reference clock time: {now_ticks}"));
            }
            let output = stream.output.clone();
            (idx, pkt, output)
        };

        let in_start = master_pkt.media_time().unwrap_or(0);
        let in_stop = in_start + (out_stop - out_start);

        let mut out_master = master_pkt;
        let prev_in_time = out_master.media_time();
        out_master.set_media_time(out_start);
        master_output.post(out_master).await;
        self.host.log(
            LogLevel::Debug,
            &format!("video: send t={out_start} (ref {})", prev_in_time.unwrap_or(0)),
        );

        let num_streams = self.lock().streams.len();
        for idx in 0..num_streams {
            if idx == master_idx {
                continue;
            }
            let kind = {
                let st = self.lock();
                st.streams[idx].input.metadata().map(|m| m.kind())
            };
            match kind {
                Some(StreamKind::AudioRaw) => {
                    self.emit_one_period_raw_audio(idx, (in_start, in_stop), (out_start, out_stop)).await;
                },
                Some(StreamKind::VideoRaw) | None => {},
                Some(_) => self.emit_one_period_sparse(idx, in_start, out_start).await,
            }
        }

        self.lock().num_ticks += 1;
    }

    /// Fill the output period with the portions of queued input samples
    /// that intersect it. All times are converted to absolute sample counts
    /// up front, which settles every precision issue in one place.
    async fn emit_one_period_raw_audio(&self, idx: usize, in_time: (i64, i64), out_time: (i64, i64)) {
        let (fmt, output, sources) = {
            let mut st = self.lock();
            let stream = &mut st.streams[idx];
            if let Some(front) = stream.queue.first() {
                if let Some(pcm) = front.pkt.as_pcm() {
                    stream.fmt = Some(*pcm.format());
                }
            }
            // can't process data if we don't know the format
            let Some(fmt) = stream.fmt else { return };

            let in_samples = (to_samples(in_time.0, fmt.sample_rate), to_samples(in_time.1, fmt.sample_rate));

            // remove obsolete samples
            while let Some(front) = stream.queue.first() {
                let Some(pcm) = front.pkt.as_pcm() else {
                    stream.queue.remove(0);
                    continue;
                };
                let start = to_samples(front.pkt.media_time().unwrap_or(0), fmt.sample_rate);
                #[allow(clippy::cast_possible_wrap)]
                let stop = start + pcm.sample_count() as i64;
                if stop >= in_samples.0 {
                    break;
                }
                stream.queue.remove(0);
            }

            let sources: Vec<Packet> = stream.queue.iter().map(|r| r.pkt.clone()).collect();
            (fmt, stream.output.clone(), sources)
        };

        let in_samples = (to_samples(in_time.0, fmt.sample_rate), to_samples(in_time.1, fmt.sample_rate));
        let out_samples = (to_samples(out_time.0, fmt.sample_rate), to_samples(out_time.1, fmt.sample_rate));
        #[allow(clippy::cast_sign_loss)]
        let out_len = (out_samples.1 - out_samples.0).max(0) as usize;

        let Some(buffer) = output.alloc_buffer(out_len * fmt.bytes_per_sample()).await else {
            self.host.log(LogLevel::Warning, "audio allocator exhausted, skipping tick");
            return;
        };
        let mut out_pcm = PcmFrame::new(fmt, out_len, buffer);

        let plane_bps = fmt.bytes_per_sample() / fmt.num_planes();
        for pkt in &sources {
            let Some(pcm) = pkt.as_pcm() else { continue };
            if *pcm.format() != fmt {
                continue;
            }
            let src_start = to_samples(pkt.media_time().unwrap_or(0), fmt.sample_rate);
            #[allow(clippy::cast_possible_wrap)]
            let src_stop = src_start + pcm.sample_count() as i64;

            // intersect this data with the media period
            let left = src_start.max(in_samples.0);
            let right = src_stop.min(in_samples.1);
            if left >= right {
                continue;
            }
            #[allow(clippy::cast_sign_loss)]
            let (src_off, dst_off, mut len) =
                ((left - src_start) as usize, (left - in_samples.0) as usize, (right - left) as usize);
            if dst_off >= out_len {
                continue;
            }
            len = len.min(out_len - dst_off);
            for plane in 0..fmt.num_planes() {
                let dst = out_pcm.plane_mut(plane);
                let src = pcm.plane(plane);
                dst[dst_off * plane_bps..(dst_off + len) * plane_bps]
                    .copy_from_slice(&src[src_off * plane_bps..(src_off + len) * plane_bps]);
            }
        }

        let mut out = Packet::from_pcm(out_pcm);
        out.set_media_time(out_time.0);
        output.post(out).await;
        self.host.log(LogLevel::Debug, &format!("audio: send t={} (ref {})", out_time.0, in_time.0));
    }

    /// Sparse raw streams: repeat the frame that best covers the tick.
    async fn emit_one_period_sparse(&self, idx: usize, in_start: i64, out_start: i64) {
        let (chosen, output) = {
            let mut st = self.lock();
            let stream = &mut st.streams[idx];
            let chosen = stream
                .queue
                .iter()
                .rev()
                .find(|r| r.pkt.media_time().unwrap_or(0) <= in_start)
                .or_else(|| stream.queue.last())
                .map(|r| r.pkt.clone())
                .or_else(|| stream.blank.clone());
            if let Some(pkt) = &chosen {
                stream.blank = Some(pkt.clone());
            }
            (chosen, stream.output.clone())
        };
        if let Some(pkt) = chosen {
            let mut out = pkt;
            out.set_media_time(out_start);
            output.post(out).await;
        }
    }
}

/// Timestamp (180 kHz ticks) to absolute sample count at `sample_rate`.
#[allow(clippy::cast_possible_truncation)]
fn to_samples(time: i64, sample_rate: u32) -> i64 {
    ((i128::from(time) * i128::from(sample_rate)) / i128::from(CLOCK_RATE)) as i64
}

#[async_trait]
impl Module for TimeRectifier {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
    fn ports_mut(&mut self) -> &mut PortSet {
        &mut self.ports
    }

    fn dynamic_inputs(&self) -> bool {
        true
    }

    /// Outputs mirror inputs: one output per input, same index.
    fn ensure_input(&mut self, idx: usize) -> Result<()> {
        while self.ports.num_inputs() <= idx {
            let input = self.ports.add_input();
            let output = self.ports.add_output_with_capacity(RECTIFIER_POOL_CAPACITY);
            let mut st = self.shared.lock();
            st.streams.push(Stream { input, output, queue: Vec::new(), blank: None, fmt: None });
        }
        Ok(())
    }

    async fn process(&mut self) -> Result<()> {
        let mut st = self.shared.lock();
        if st.video_timeout {
            return Err(CastflowError::Runtime("requires to have one video stream connected".to_string()));
        }
        if st.pending.is_none() && !st.stopped {
            st.pending = Some(schedule_tick(&self.shared, self.shared.clock.now()));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let mut st = self.shared.lock();
        st.stopped = true;
        if let Some(id) = st.pending.take() {
            self.shared.scheduler.cancel(id);
        }
        if st.video_timeout {
            return Err(CastflowError::Runtime("requires to have one video stream connected".to_string()));
        }
        Ok(())
    }
}

impl Drop for TimeRectifier {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.stopped = true;
        if let Some(id) = st.pending.take() {
            self.shared.scheduler.cancel(id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_possible_wrap)]
mod tests {
    use super::*;
    use castflow_core::clock::{timescale_to_clock, TestClock};
    use castflow_core::metadata::{Metadata, PixelFormat, RawVideoInfo, Resolution};
    use castflow_core::module::NullHost;
    use castflow_core::pool::PooledBuffer;
    use castflow_core::ports::connect_ports;
    use castflow_core::scheduler::TestScheduler;

    fn video_meta(fps: (i64, i64)) -> Arc<Metadata> {
        Arc::new(Metadata::RawVideo(RawVideoInfo {
            resolution: Resolution::new(320, 180),
            pixel_format: PixelFormat::I420,
            framerate: fps,
        }))
    }

    fn audio_meta(fmt: PcmFormat) -> Arc<Metadata> {
        Arc::new(Metadata::RawAudio(fmt))
    }

    struct Fixture {
        rectifier: Box<dyn Module>,
        scheduler: Arc<TestScheduler>,
        sinks: Vec<Arc<InputPort>>,
    }

    impl Fixture {
        fn new(out_fps: (i64, i64), metas: &[Arc<Metadata>]) -> Self {
            let clock = Arc::new(TestClock::default());
            let scheduler = Arc::new(TestScheduler::new(clock.clone()));
            let host = Arc::new(NullHost::default());
            let cfg = TimeRectifierConfig { framerate_num: out_fps.0, framerate_den: out_fps.1 };
            let mut rectifier = TimeRectifier::new(host, &cfg, clock.clone(), scheduler.clone());

            let mut sinks = Vec::new();
            for (idx, meta) in metas.iter().enumerate() {
                rectifier.ensure_input(idx).unwrap();
                rectifier.ports().input(idx).unwrap().set_metadata(meta.clone());
                let sink = Arc::new(InputPort::new());
                let output = rectifier.ports().output(idx).unwrap();
                connect_ports(&output, &sink, Arc::new(|_| Box::pin(async {}))).unwrap();
                sinks.push(sink);
            }
            Self { rectifier, scheduler, sinks }
        }

        fn push_video(&self, idx: usize, media_time: i64) {
            let mut pkt = Packet::empty();
            pkt.set_media_time(media_time);
            self.rectifier.ports().input(idx).unwrap().push(pkt).unwrap();
        }

        fn push_audio(&self, idx: usize, fmt: PcmFormat, start_sample: i64, count: usize) {
            let frame = PcmFrame::new(fmt, count, PooledBuffer::detached(Vec::new()));
            let mut pkt = Packet::from_pcm(frame);
            pkt.set_media_time(timescale_to_clock(start_sample, i64::from(fmt.sample_rate)));
            self.rectifier.ports().input(idx).unwrap().push(pkt).unwrap();
        }

        fn drain_times(&self, idx: usize) -> Vec<i64> {
            let mut times = Vec::new();
            while let Some(pkt) = self.sinks[idx].try_pop() {
                times.push(pkt.media_time().unwrap());
            }
            times
        }
    }

    #[tokio::test]
    async fn passthrough_25fps_is_exactly_periodic() {
        let mut f = Fixture::new((25, 1), &[video_meta((25, 1))]);
        f.push_video(0, 0);
        f.rectifier.process().await.unwrap();

        for k in 1..150i64 {
            f.scheduler.advance_to(Fraction::new(k - 1, 25)).await;
            f.push_video(0, k * 7200);
        }
        f.scheduler.advance_to(Fraction::new(149, 25)).await;
        f.rectifier.flush().await.unwrap();

        let times = f.drain_times(0);
        assert_eq!(times.len(), 150);
        for (k, t) in times.iter().enumerate() {
            assert_eq!(*t, k as i64 * 7200);
        }
    }

    #[tokio::test]
    async fn audio_sample_count_is_conserved() {
        let fmt = PcmFormat::default(); // 44.1 kHz stereo F32 planar
        let mut f = Fixture::new((25, 1), &[video_meta((25, 1)), audio_meta(fmt)]);

        // samples per 25 fps tick at 44.1 kHz
        let samples_per_tick = 44_100 / 25;
        let mut next_audio_sample = 0i64;
        let mut total = 0usize;
        let mut expected_time = 0i64;
        let mut frames = 0usize;
        let mut consume = |f: &Fixture| {
            while let Some(pkt) = f.sinks[1].try_pop() {
                assert_eq!(pkt.media_time(), Some(expected_time));
                expected_time += 7200;
                let pcm = pkt.as_pcm().unwrap();
                assert_eq!(pcm.sample_count() as i64, samples_per_tick);
                total += pcm.sample_count();
                frames += 1;
            }
        };

        f.push_video(0, 0);
        f.rectifier.process().await.unwrap();

        for k in 0..150i64 {
            // keep the audio ahead of the tick's media period
            while next_audio_sample < (k + 2) * samples_per_tick {
                f.push_audio(1, fmt, next_audio_sample, 1024);
                next_audio_sample += 1024;
            }
            if k > 0 {
                f.push_video(0, k * 7200);
            }
            f.scheduler.advance_to(Fraction::new(k, 25)).await;
            // consume as we go, releasing pooled buffers like a real sink
            consume(&f);
        }
        f.rectifier.flush().await.unwrap();
        consume(&f);

        assert_eq!(frames, 150);
        assert_eq!(total as i64, 150 * samples_per_tick); // 264600, bit-exact
    }

    #[tokio::test]
    async fn upsample_25_to_ntsc_is_drift_free() {
        // 25 fps in, 30000/1001 out
        let mut f = Fixture::new((30_000, 1001), &[video_meta((25, 1))]);
        f.push_video(0, 0);
        f.rectifier.process().await.unwrap();

        let mut next_in_frame = 1i64;
        for k in 0..180i64 {
            let target = Fraction::new(k * 1001, 30_000);
            while Fraction::new(next_in_frame, 25) <= target {
                f.push_video(0, next_in_frame * 7200);
                next_in_frame += 1;
            }
            f.scheduler.advance_to(target).await;
        }
        f.rectifier.flush().await.unwrap();

        let times = f.drain_times(0);
        assert_eq!(times.len(), 180);
        for (k, t) in times.iter().enumerate() {
            // 180000 * 1001 / 30000 = 6006, exactly
            assert_eq!(*t, k as i64 * 6006);
        }
    }

    #[tokio::test]
    async fn downsample_halves_the_output_rate() {
        let mut f = Fixture::new((25, 2), &[video_meta((25, 1))]);
        f.push_video(0, 0);
        f.rectifier.process().await.unwrap();

        for k in 1..150i64 {
            f.push_video(0, k * 7200);
            f.scheduler.advance_to(Fraction::new(k, 25)).await;
        }
        f.rectifier.flush().await.unwrap();

        let times = f.drain_times(0);
        // one output every two input frames, exactly periodic
        assert!(times.len() >= 74);
        for (k, t) in times.iter().enumerate() {
            assert_eq!(*t, k as i64 * 14400);
        }
    }

    #[tokio::test]
    async fn backward_input_discontinuity_keeps_output_monotonic() {
        let mut f = Fixture::new((25, 1), &[video_meta((25, 1))]);
        f.push_video(0, 0);
        f.rectifier.process().await.unwrap();

        for k in 1..50i64 {
            // input times jump back to zero halfway through
            let media = if k < 25 { k * 7200 } else { (k - 25) * 7200 };
            f.push_video(0, media);
            f.scheduler.advance_to(Fraction::new(k, 25)).await;
        }
        f.rectifier.flush().await.unwrap();

        let times = f.drain_times(0);
        assert!(times.len() >= 49);
        for window in times.windows(2) {
            assert!(window[1] > window[0]);
        }
        for (k, t) in times.iter().enumerate() {
            assert_eq!(*t, k as i64 * 7200);
        }
    }

    #[tokio::test]
    async fn missing_frames_are_repeated() {
        let mut f = Fixture::new((25, 1), &[video_meta((25, 1))]);
        f.push_video(0, 0);
        f.rectifier.process().await.unwrap();

        for k in 1..100i64 {
            if k % 3 != 0 {
                f.push_video(0, k * 7200);
            }
            f.scheduler.advance_to(Fraction::new(k, 25)).await;
        }
        f.rectifier.flush().await.unwrap();

        // ticks without input data still produce a frame
        let times = f.drain_times(0);
        assert_eq!(times.len(), 100);
        for (k, t) in times.iter().enumerate() {
            assert_eq!(*t, k as i64 * 7200);
        }
    }

    #[tokio::test]
    async fn missing_video_master_fails_after_the_grace_window() {
        let fmt = PcmFormat::default();
        // audio only: the required video reference stream never appears
        let mut f = Fixture::new((25, 1), &[audio_meta(fmt)]);
        f.push_audio(0, fmt, 0, 1024);
        f.rectifier.process().await.unwrap();

        // run well past the grace window; ticking must stop on its own
        f.scheduler.advance_to(Fraction::new(2, 1)).await;
        assert!(f.sinks[0].try_pop().is_none());

        // the failure surfaces at the module boundary
        assert!(f.rectifier.process().await.is_err());
        assert!(f.rectifier.flush().await.is_err());
    }

    #[tokio::test]
    async fn flush_is_idempotent_and_cancels_the_tick() {
        let mut f = Fixture::new((25, 1), &[video_meta((25, 1))]);
        f.push_video(0, 0);
        f.rectifier.process().await.unwrap();
        f.scheduler.advance_to(Fraction::new(1, 25)).await;

        f.rectifier.flush().await.unwrap();
        f.rectifier.flush().await.unwrap();

        let produced = f.drain_times(0).len();
        // no further ticks fire once flushed
        f.scheduler.advance_to(Fraction::new(10, 1)).await;
        assert_eq!(f.drain_times(0).len(), 0);
        assert!(produced >= 1);
    }
}

