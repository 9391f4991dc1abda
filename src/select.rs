use std::io::{BufRead, Write};

use restream_core::{SourceCapture, SourceDescriptor};

pub enum Selection {
    Source(SourceDescriptor),
    Exit,
}

/// Lists discovered sources and reads a choice: a number selects, `r`
/// rescans, `e` (or end of input) exits.
pub fn prompt_source<C, R, W>(capture: &mut C, input: &mut R, out: &mut W) -> anyhow::Result<Selection>
where
    C: SourceCapture,
    R: BufRead,
    W: Write,
{
    let mut sources = capture.discover()?;
    loop {
        if sources.is_empty() {
            writeln!(out, "No sources found.")?;
        } else {
            writeln!(out, "Available sources:")?;
            for (i, source) in sources.iter().enumerate() {
                writeln!(out, "  {}: {}", i, source)?;
            }
        }
        write!(out, "Select a source, (r)efresh or (e)xit: ")?;
        out.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(Selection::Exit);
        }
        match line.trim() {
            "e" | "exit" => return Ok(Selection::Exit),
            "r" | "refresh" => sources = capture.discover()?,
            choice => match choice.parse::<usize>().ok().and_then(|i| sources.get(i)) {
                Some(source) => return Ok(Selection::Source(source.clone())),
                None => writeln!(out, "Invalid choice: {}", choice)?,
            },
        }
    }
}
