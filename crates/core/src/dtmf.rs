//! DTMF digit capture.
//!
//! A capture accumulates keypad digits until its [`DtmfPolicy`] says the entry
//! is complete: a terminator digit, a maximum digit count, or (driven by the
//! owner through [`DtmfCapture::finish`]) an inter-digit idle timeout. The
//! finished digit string is returned exactly once; afterwards the capture is
//! inert and a fresh one must be created for the next entry.

use crate::error::DtmfCaptureError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtmfState {
    #[default]
    Idle,
    Capturing,
    Complete,
}

/// When a capture is considered complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtmfPolicy {
    /// Digit that ends the entry. It is not part of the result.
    pub terminator: Option<char>,
    /// Completes the entry as soon as this many digits were collected.
    pub max_digits: Option<usize>,
    /// Idle gap after the last digit that completes the entry.
    pub inter_digit_timeout: Option<Duration>,
}

impl Default for DtmfPolicy {
    fn default() -> Self {
        Self {
            terminator: Some('#'),
            max_digits: None,
            inter_digit_timeout: Some(Duration::from_millis(3000)),
        }
    }
}

/// Returns true for the sixteen DTMF symbols.
pub fn is_dtmf_digit(c: char) -> bool {
    matches!(c, '0'..='9' | '*' | '#' | 'A'..='D')
}

#[derive(Debug, Clone)]
pub struct DtmfCapture {
    policy: DtmfPolicy,
    state: DtmfState,
    digits: String,
}

impl DtmfCapture {
    pub fn new(policy: DtmfPolicy) -> Self {
        Self {
            policy,
            state: DtmfState::Idle,
            digits: String::new(),
        }
    }

    pub fn state(&self) -> DtmfState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == DtmfState::Complete
    }

    /// Digits collected so far.
    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// Feeds one digit. Returns `Ok(Some(digits))` when this digit completed
    /// the entry.
    pub fn process_digit(&mut self, digit: &str) -> Result<Option<String>, DtmfCaptureError> {
        if self.state == DtmfState::Complete {
            return Err(DtmfCaptureError::CaptureComplete);
        }

        let mut chars = digit.chars();
        let c = match (chars.next(), chars.next()) {
            (Some(c), None) if is_dtmf_digit(c.to_ascii_uppercase()) => c.to_ascii_uppercase(),
            _ => return Err(DtmfCaptureError::InvalidDigit(digit.to_string())),
        };

        self.state = DtmfState::Capturing;

        if self.policy.terminator == Some(c) {
            return Ok(self.complete());
        }

        self.digits.push(c);
        if self
            .policy
            .max_digits
            .is_some_and(|max| self.digits.len() >= max)
        {
            return Ok(self.complete());
        }
        Ok(None)
    }

    /// Completes an in-progress capture, e.g. after the idle timeout.
    ///
    /// Returns `None` unless the capture was `Capturing`.
    pub fn finish(&mut self) -> Option<String> {
        if self.state == DtmfState::Capturing {
            self.complete()
        } else {
            None
        }
    }

    fn complete(&mut self) -> Option<String> {
        self.state = DtmfState::Complete;
        Some(std::mem::take(&mut self.digits))
    }
}
