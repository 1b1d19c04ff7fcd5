/// Fabricated peer for an accepted `direct-tcpip` channel.
///
/// No socket is ever opened. Client payload is sampled up to a byte budget for
/// auditing, and a configured service banner is played back once.
#[derive(Debug)]
pub struct ForwardCapture {
    response: Option<Vec<u8>>,
    captured: usize,
    max_capture: usize,
    truncated: bool,
}

/// A slice of client payload selected for the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedSample {
    pub bytes: Vec<u8>,
    /// Part of this chunk fell outside the capture budget.
    pub truncated: bool,
}

impl ForwardCapture {
    pub fn new(response: Option<&str>, max_capture: usize) -> Self {
        Self {
            response: response
                .filter(|r| !r.is_empty())
                .map(|r| r.as_bytes().to_vec()),
            captured: 0,
            max_capture,
            truncated: false,
        }
    }

    /// Service banner to send when the channel opens, at most once.
    pub fn take_response(&mut self) -> Option<Vec<u8>> {
        self.response.take()
    }

    /// Take the part of `data` that still fits the capture budget.
    /// Returns `None` once the budget is exhausted.
    pub fn capture(&mut self, data: &[u8]) -> Option<CapturedSample> {
        if data.is_empty() || self.truncated {
            return None;
        }
        let room = self.max_capture.saturating_sub(self.captured);
        if room == 0 {
            self.truncated = true;
            return None;
        }
        let take = room.min(data.len());
        self.captured += take;
        let truncated = take < data.len();
        if truncated {
            self.truncated = true;
        }
        Some(CapturedSample {
            bytes: data[..take].to_vec(),
            truncated,
        })
    }

    pub fn captured(&self) -> usize {
        self.captured
    }
}
