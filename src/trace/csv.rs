//! Tabular output: one row per sample

use super::DecodedTrace;
use std::io::{self, Write};

pub(super) fn write<W: Write>(trace: &DecodedTrace, w: &mut W) -> io::Result<()> {
    let unit = if trace.sample_period_ps.is_some() { "time_ps" } else { "sample" };
    write!(w, "{}", unit)?;
    for signal in &trace.signals {
        write!(w, ",{}", signal.name)?;
    }
    writeln!(w)?;

    for i in 0..trace.len() {
        write!(w, "{}", trace.timestamp(i))?;
        for signal in &trace.signals {
            write!(w, ",{}", signal.values[i])?;
        }
        writeln!(w)?;
    }
    Ok(())
}
