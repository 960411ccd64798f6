use std::io::{self, Stderr, Write};

use crossterm::{
    cursor::{MoveDown, MoveToColumn, MoveUp},
    queue,
    style::Print,
    terminal::{Clear, ClearType},
};

/// Redraws a block of status lines in place on stderr.
pub struct Display {
    out: Stderr,
    lines: u16,
    last_frame: u16,
}

impl Display {
    pub fn new() -> Self {
        Self {
            out: io::stderr(),
            lines: 0,
            last_frame: 0,
        }
    }

    /// Write one line of the current frame, replacing what was there.
    pub fn log(&mut self, line: &str) -> io::Result<()> {
        queue!(
            self.out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(line),
            Print("\n"),
        )?;
        self.lines = self.lines.saturating_add(1);
        Ok(())
    }

    /// Move the cursor back to the start of the frame so the next one
    /// overwrites it.
    pub fn reset_cursor(&mut self) -> io::Result<()> {
        if self.lines > 0 {
            queue!(self.out, MoveUp(self.lines))?;
        }
        self.out.flush()?;
        self.last_frame = self.lines;
        self.lines = 0;
        Ok(())
    }

    /// Move below the last frame so later output does not overwrite it.
    pub fn close(&mut self) -> io::Result<()> {
        if self.last_frame > 0 {
            queue!(self.out, MoveDown(self.last_frame), MoveToColumn(0))?;
        }
        self.out.flush()
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
