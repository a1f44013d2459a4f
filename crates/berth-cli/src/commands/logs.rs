use super::EXIT_SUCCESS;
use berth_core::logs::{LogEntry, LogOptions};
use berth_core::Engine;
use std::io::{self, Write};

/// Write one entry to the stream it was captured from.
pub fn emit(entry: &LogEntry, timestamps: bool) -> io::Result<()> {
    let text = entry.render(timestamps);
    if entry.stream == "stderr" {
        io::stderr().write_all(text.as_bytes())
    } else {
        let mut out = io::stdout().lock();
        out.write_all(text.as_bytes())?;
        out.flush()
    }
}

pub fn run(engine: &Engine, container: &str, opts: LogOptions) -> Result<u8, String> {
    engine
        .logs(container, opts, &mut |entry| emit(entry, opts.timestamps))
        .map_err(|e| e.to_string())?;
    Ok(EXIT_SUCCESS)
}
