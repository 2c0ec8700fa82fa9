//! Turn-Taking Controller
//!
//! Sole owner of `TurnState`. Every operation is a pure state change that
//! returns the `Transition` it caused (if any); the caller applies the side
//! effects (start/stop capture, cancel transcription, play audio). Keeping the
//! controller free of I/O lets the call engine apply an AI-audio preemption in
//! the same step the message is handled.

use crate::vad::UtteranceId;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TurnState {
    /// Nobody is speaking, capture inactive
    Idle,
    /// Capture active, accumulating an utterance
    Listening,
    /// Utterance boundary detected, transcription/hand-off in flight
    Finalizing,
    /// AI audio enqueued or playing, capture suspended
    AiSpeaking,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Idle => "Idle",
            TurnState::Listening => "Listening",
            TurnState::Finalizing => "Finalizing",
            TurnState::AiSpeaking => "AISpeaking",
        };
        f.write_str(name)
    }
}

/// One inbound AI audio message
pub type PlaybackId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TurnState,
    pub to: TurnState,
    /// Utterance whose transcription/hand-off was cancelled by this transition
    pub cancelled: Option<UtteranceId>,
}

/// Result of a new AI audio message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AiAudio {
    pub transition: Option<Transition>,
    /// Start this playback now; otherwise it waits in the queue
    pub play_now: bool,
}

/// Result of a playback completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Completion for a playback that is not current (duplicate or stale)
    Ignored,
    /// Queue not drained yet; start this one next
    Next(PlaybackId),
    /// Queue drained, the user has the turn again
    Resumed(Transition),
}

#[derive(Debug)]
pub struct TurnController {
    state: TurnState,
    in_flight: Option<UtteranceId>,
    playbacks: VecDeque<PlaybackId>,
    torn_down: bool,
}

impl Default for TurnController {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnController {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            in_flight: None,
            playbacks: VecDeque::new(),
            torn_down: false,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Utterance currently being handed off, if any
    pub fn in_flight(&self) -> Option<UtteranceId> {
        self.in_flight
    }

    /// Current plus queued AI playbacks
    pub fn pending_playbacks(&self) -> usize {
        self.playbacks.len()
    }

    pub fn current_playback(&self) -> Option<PlaybackId> {
        self.playbacks.front().copied()
    }

    /// Whether capture hardware may run right now
    pub fn may_capture(&self) -> bool {
        !self.torn_down && self.state == TurnState::Listening
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Call connected: Idle -> Listening
    pub fn start(&mut self) -> Option<Transition> {
        if self.torn_down || self.state != TurnState::Idle {
            return None;
        }
        Some(self.go(TurnState::Listening, None))
    }

    /// The pipeline finalized an utterance: Listening -> Finalizing
    pub fn begin_finalize(&mut self, utterance: UtteranceId) -> Option<Transition> {
        if self.torn_down || self.state != TurnState::Listening || self.in_flight.is_some() {
            log::debug!("Ignoring finalize of utterance {} in {}", utterance, self.state);
            return None;
        }
        self.in_flight = Some(utterance);
        Some(self.go(TurnState::Finalizing, None))
    }

    /// The utterance reached the transport: Finalizing -> Listening
    pub fn complete_handoff(&mut self, utterance: UtteranceId) -> Option<Transition> {
        self.settle(utterance, "handed off")
    }

    /// The utterance was dropped (STT failure, empty result): Finalizing -> Listening
    pub fn abandon_utterance(&mut self, utterance: UtteranceId) -> Option<Transition> {
        self.settle(utterance, "abandoned")
    }

    /// Inbound AI audio: (any) -> AISpeaking, preempting capture and hand-off
    pub fn ai_audio_arrived(&mut self, playback: PlaybackId) -> AiAudio {
        if self.torn_down {
            return AiAudio {
                transition: None,
                play_now: false,
            };
        }

        self.playbacks.push_back(playback);
        if self.state == TurnState::AiSpeaking {
            log::debug!("AI audio {} queued behind {} playback(s)", playback, self.playbacks.len() - 1);
            return AiAudio {
                transition: None,
                play_now: false,
            };
        }

        let cancelled = self.in_flight.take();
        AiAudio {
            transition: Some(self.go(TurnState::AiSpeaking, cancelled)),
            play_now: true,
        }
    }

    /// A playback ended (naturally or by failure)
    pub fn playback_finished(&mut self, playback: PlaybackId) -> PlaybackOutcome {
        if self.torn_down || self.playbacks.front() != Some(&playback) {
            log::debug!("Ignoring completion of playback {}", playback);
            return PlaybackOutcome::Ignored;
        }

        self.playbacks.pop_front();
        match self.playbacks.front() {
            Some(next) => PlaybackOutcome::Next(*next),
            None => PlaybackOutcome::Resumed(self.go(TurnState::Listening, None)),
        }
    }

    /// The transport went away and may come back: (any) -> Idle, dropping queued audio
    pub fn suspend(&mut self) -> Option<Transition> {
        if self.torn_down {
            return None;
        }
        self.playbacks.clear();
        let cancelled = self.in_flight.take();
        if self.state == TurnState::Idle {
            return None;
        }
        Some(self.go(TurnState::Idle, cancelled))
    }

    /// The call ended; every later operation is a no-op
    pub fn teardown(&mut self) -> Option<Transition> {
        let transition = self.suspend();
        self.torn_down = true;
        transition
    }

    fn settle(&mut self, utterance: UtteranceId, what: &str) -> Option<Transition> {
        if self.torn_down || self.state != TurnState::Finalizing || self.in_flight != Some(utterance) {
            log::debug!("Utterance {} {} after its turn ended", utterance, what);
            return None;
        }
        self.in_flight = None;
        Some(self.go(TurnState::Listening, None))
    }

    fn go(&mut self, to: TurnState, cancelled: Option<UtteranceId>) -> Transition {
        let from = self.state;
        self.state = to;
        match cancelled {
            Some(id) => log::info!("Turn state: {} -> {} (utterance {} cancelled)", from, to, id),
            None => log::info!("Turn state: {} -> {}", from, to),
        }
        Transition { from, to, cancelled }
    }
}
