//! Audio/video reference clock.
//!
//! The master stream anchors media time to a wall-clock instant every time it
//! presents; the other stream asks how far its next frame is from that anchor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::TimeBase;

#[derive(Clone, Copy, Debug)]
struct Anchor {
    media_time: f64,
    instant: Instant,
}

impl Anchor {
    /// Media time the anchor extrapolates to at `now`.
    fn media_time_at(&self, now: Instant) -> f64 {
        if now >= self.instant {
            self.media_time + now.duration_since(self.instant).as_secs_f64()
        } else {
            self.media_time - self.instant.duration_since(now).as_secs_f64()
        }
    }
}

pub struct SyncClock {
    master_is_audio: AtomicBool,
    anchor: Mutex<Option<Anchor>>,
}

impl SyncClock {
    pub fn new(master_is_audio: bool) -> Self {
        Self {
            master_is_audio: AtomicBool::new(master_is_audio),
            anchor: Mutex::new(None),
        }
    }

    pub fn master_is_audio(&self) -> bool {
        self.master_is_audio.load(Ordering::Acquire)
    }

    /// Re-derive the master from which streams are presented.
    ///
    /// Audio cannot be master without audio and video cannot be master without video;
    /// with both present `prefer_audio` decides. Changing master drops the anchor.
    pub fn select_master(&self, has_audio: bool, has_video: bool, prefer_audio: bool) {
        let audio = match (has_audio, has_video) {
            (true, false) => true,
            (false, true) => false,
            (true, true) => prefer_audio,
            (false, false) => self.master_is_audio(),
        };
        let previous = self.master_is_audio.swap(audio, Ordering::AcqRel);
        if previous != audio {
            tracing::debug!(master = if audio { "audio" } else { "video" }, "master clock changed");
            self.reset();
        }
    }

    /// Forget the anchor (pause entry, seek).
    pub fn reset(&self) {
        *self.lock() = None;
    }

    pub fn is_anchored(&self) -> bool {
        self.lock().is_some()
    }

    /// Video frame at `pts` was just handed to the renderer.
    pub fn present_video(&self, pts: i64, time_base: TimeBase) {
        if self.master_is_audio() {
            return;
        }
        self.anchor_at(time_base.seconds(pts), Instant::now());
    }

    /// Audio frame at `pts` was just copied to the device with `pre_buffer` of audio
    /// already queued ahead of it.
    pub fn present_audio(&self, pts: i64, time_base: TimeBase, pre_buffer: Duration) {
        if !self.master_is_audio() {
            return;
        }
        self.anchor_at(time_base.seconds(pts), Instant::now() + pre_buffer);
    }

    /// Seconds until a video frame at `pts` is due; negative when late.
    ///
    /// Zero when video is master or nothing anchors the clock yet.
    pub fn remain_time_for_video(&self, pts: i64, time_base: TimeBase) -> f64 {
        if !self.master_is_audio() {
            return 0.0;
        }
        self.remain_time(pts, time_base)
    }

    /// Seconds until an audio frame at `pts` is due; negative when late.
    ///
    /// Zero when audio is master or nothing anchors the clock yet.
    pub fn remain_time_for_audio(&self, pts: i64, time_base: TimeBase) -> f64 {
        if self.master_is_audio() {
            return 0.0;
        }
        self.remain_time(pts, time_base)
    }

    fn remain_time(&self, pts: i64, time_base: TimeBase) -> f64 {
        let anchor = *self.lock();
        match anchor {
            Some(anchor) => time_base.seconds(pts) - anchor.media_time_at(Instant::now()),
            None => 0.0,
        }
    }

    fn anchor_at(&self, media_time: f64, instant: Instant) {
        *self.lock() = Some(Anchor {
            media_time,
            instant,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Anchor>> {
        self.anchor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
