/// Default cap on a single input line.
pub const MAX_LINE_LENGTH: usize = 4096;

const MAX_HISTORY: usize = 100;

/// ANSI escape sequence parsing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapeState {
    /// Normal input mode
    Normal,
    /// Received ESC byte, waiting for '[' or other
    GotEsc,
    /// Received ESC+[, waiting for final byte (CSI sequence)
    GotCsi,
}

/// What a completed unit of input means to the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// A full line (without the terminator).
    Line(String),
    /// Ctrl+C: the pending line was discarded.
    Interrupt,
    /// Ctrl+D on an empty line.
    Eof,
}

/// Line editing for the fabricated shell: echo, backspace, control keys,
/// history recall, and swallowing of escape sequences.
///
/// Without a pty the editor is a plain line splitter: nothing is echoed and
/// `\r` is ignored so `\r\n` terminated input yields one line.
pub struct LineEditor {
    line_buffer: Vec<u8>,
    cursor_pos: usize,
    echo: bool,
    max_line_length: usize,
    /// Command history (oldest first)
    history: Vec<String>,
    /// Current position in history during navigation (None = not navigating)
    history_index: Option<usize>,
    /// Saved line buffer before history navigation started
    saved_line: Vec<u8>,
    esc_state: EscapeState,
}

impl LineEditor {
    pub fn new(echo: bool, max_line_length: usize) -> Self {
        Self {
            line_buffer: Vec::new(),
            cursor_pos: 0,
            echo,
            max_line_length: max_line_length.max(1),
            history: Vec::new(),
            history_index: None,
            saved_line: Vec::new(),
            esc_state: EscapeState::Normal,
        }
    }

    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn pending(&self) -> &[u8] {
        &self.line_buffer
    }

    /// Feed a chunk of input. Returns the bytes to echo and the completed
    /// events, in order.
    pub fn feed(&mut self, data: &[u8]) -> (Vec<u8>, Vec<LineEvent>) {
        let mut echo = Vec::new();
        let mut events = Vec::new();
        for &byte in data {
            let (bytes, event) = self.process_byte(byte);
            echo.extend_from_slice(&bytes);
            if let Some(event) = event {
                events.push(event);
            }
        }
        if !self.echo {
            echo.clear();
        }
        (echo, events)
    }

    /// Process a byte of input, returns (echo_bytes, completed_event)
    pub fn process_byte(&mut self, byte: u8) -> (Vec<u8>, Option<LineEvent>) {
        if self.esc_state == EscapeState::GotEsc {
            self.esc_state = EscapeState::Normal;
            if byte == b'[' {
                self.esc_state = EscapeState::GotCsi;
            }
            return (Vec::new(), None);
        }
        if self.esc_state == EscapeState::GotCsi {
            // Parameter bytes (digits, ';') keep the sequence open.
            if (0x30..=0x3f).contains(&byte) {
                return (Vec::new(), None);
            }
            self.esc_state = EscapeState::Normal;
            return match byte {
                b'A' => self.history_prev(),
                b'B' => self.history_next(),
                b'C' => {
                    if self.cursor_pos < self.line_buffer.len() {
                        self.cursor_pos += 1;
                        (b"\x1b[C".to_vec(), None)
                    } else {
                        (Vec::new(), None)
                    }
                }
                b'D' => {
                    if self.cursor_pos > 0 {
                        self.cursor_pos -= 1;
                        (b"\x1b[D".to_vec(), None)
                    } else {
                        (Vec::new(), None)
                    }
                }
                _ => (Vec::new(), None),
            };
        }

        match byte {
            b'\r' if !self.echo => (Vec::new(), None),
            b'\r' | b'\n' => {
                let line = String::from_utf8_lossy(&self.line_buffer).into_owned();
                if !line.trim().is_empty() && self.history.last() != Some(&line) {
                    self.history.push(line.clone());
                    if self.history.len() > MAX_HISTORY {
                        self.history.remove(0);
                    }
                }
                self.reset_line();
                (b"\r\n".to_vec(), Some(LineEvent::Line(line)))
            }
            // Backspace or DEL
            0x7f | 0x08 => {
                if self.cursor_pos > 0 {
                    self.line_buffer.remove(self.cursor_pos - 1);
                    self.cursor_pos -= 1;
                    (b"\x08 \x08".to_vec(), None)
                } else {
                    (Vec::new(), None)
                }
            }
            // Ctrl+C
            0x03 => {
                self.reset_line();
                (b"^C\r\n".to_vec(), Some(LineEvent::Interrupt))
            }
            // Ctrl+D
            0x04 => {
                if self.line_buffer.is_empty() {
                    (Vec::new(), Some(LineEvent::Eof))
                } else {
                    (Vec::new(), None)
                }
            }
            // Ctrl+U (kill line)
            0x15 => {
                let backspaces = self.cursor_pos;
                self.line_buffer.clear();
                self.cursor_pos = 0;
                (b"\x08 \x08".repeat(backspaces), None)
            }
            0x1b => {
                self.esc_state = EscapeState::GotEsc;
                (Vec::new(), None)
            }
            // Printable bytes, including UTF-8 continuation bytes
            _ if byte >= 0x20 => {
                if self.line_buffer.len() >= self.max_line_length {
                    return (vec![0x07], None); // BEL
                }
                self.line_buffer.insert(self.cursor_pos, byte);
                self.cursor_pos += 1;
                (vec![byte], None)
            }
            _ => (Vec::new(), None),
        }
    }

    fn reset_line(&mut self) {
        self.history_index = None;
        self.saved_line.clear();
        self.line_buffer.clear();
        self.cursor_pos = 0;
    }

    /// Replace the current line buffer with new content, returning echo bytes
    /// that clear the old line and display the new one.
    fn replace_line(&mut self, new_content: &[u8]) -> Vec<u8> {
        let mut echo = b"\x08".repeat(self.cursor_pos);
        let old_len = self.line_buffer.len();
        echo.resize(echo.len() + old_len, b' ');
        echo.extend_from_slice(&b"\x08".repeat(old_len));
        echo.extend_from_slice(new_content);
        self.line_buffer = new_content.to_vec();
        self.cursor_pos = new_content.len();
        echo
    }

    fn history_prev(&mut self) -> (Vec<u8>, Option<LineEvent>) {
        if self.history.is_empty() {
            return (Vec::new(), None);
        }
        let new_index = match self.history_index {
            None => {
                self.saved_line = self.line_buffer.clone();
                self.history.len() - 1
            }
            Some(0) => return (Vec::new(), None),
            Some(i) => i - 1,
        };
        self.history_index = Some(new_index);
        let entry = self.history[new_index].clone().into_bytes();
        (self.replace_line(&entry), None)
    }

    fn history_next(&mut self) -> (Vec<u8>, Option<LineEvent>) {
        match self.history_index {
            None => (Vec::new(), None),
            Some(i) if i + 1 >= self.history.len() => {
                self.history_index = None;
                let saved = std::mem::take(&mut self.saved_line);
                (self.replace_line(&saved), None)
            }
            Some(i) => {
                self.history_index = Some(i + 1);
                let entry = self.history[i + 1].clone().into_bytes();
                (self.replace_line(&entry), None)
            }
        }
    }
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new(true, MAX_LINE_LENGTH)
    }
}
