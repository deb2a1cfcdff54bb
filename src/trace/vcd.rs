//! Value change dump output

use super::DecodedTrace;
use std::io::{self, Write};

/// Scope all analyzer signals are declared in
const SCOPE: &str = "analyzer";

/// Printable VCD identifier for signal `index`
fn id_code(mut index: usize) -> String {
    let mut code = String::new();
    loop {
        code.push((b'!' + (index % 94) as u8) as char);
        index /= 94;
        if index == 0 {
            return code;
        }
    }
}

fn write_value<W: Write>(w: &mut W, width: u32, value: u128, id: &str) -> io::Result<()> {
    if width == 1 {
        writeln!(w, "{}{}", value & 1, id)
    } else {
        writeln!(w, "b{:b} {}", value, id)
    }
}

/// Write `trace` as a VCD with an extra `trigger` wire high at the trigger sample.
///
/// Time unit is 1 ps when the sample period is known, otherwise one sample per ns.
pub(super) fn write<W: Write>(trace: &DecodedTrace, w: &mut W) -> io::Result<()> {
    let timescale = if trace.sample_period_ps.is_some() { "1ps" } else { "1ns" };
    writeln!(w, "$version usb3scope {} $end", env!("CARGO_PKG_VERSION"))?;
    writeln!(w, "$timescale {} $end", timescale)?;
    writeln!(w, "$scope module {} $end", SCOPE)?;

    let ids: Vec<String> = (0..=trace.signals.len()).map(id_code).collect();
    for (signal, id) in trace.signals.iter().zip(&ids) {
        if signal.width == 1 {
            writeln!(w, "$var wire 1 {} {} $end", id, signal.name)?;
        } else {
            writeln!(
                w,
                "$var wire {} {} {} [{}:0] $end",
                signal.width,
                id,
                signal.name,
                signal.width - 1
            )?;
        }
    }
    let trigger_id = &ids[trace.signals.len()];
    writeln!(w, "$var wire 1 {} trigger $end", trigger_id)?;
    writeln!(w, "$upscope $end")?;
    writeln!(w, "$enddefinitions $end")?;

    let samples = trace.len();
    if samples == 0 {
        return Ok(());
    }

    writeln!(w, "#0")?;
    writeln!(w, "$dumpvars")?;
    for (signal, id) in trace.signals.iter().zip(&ids) {
        write_value(w, signal.width, signal.values[0], id)?;
    }
    write_value(w, 1, (trace.trigger_index == 0) as u128, trigger_id)?;
    writeln!(w, "$end")?;

    for i in 1..samples {
        let trigger_edge = i == trace.trigger_index || i == trace.trigger_index + 1;
        let changed = trace
            .signals
            .iter()
            .any(|s| s.values[i] != s.values[i - 1]);
        if !changed && !trigger_edge {
            continue;
        }

        writeln!(w, "#{}", trace.timestamp(i))?;
        for (signal, id) in trace.signals.iter().zip(&ids) {
            if signal.values[i] != signal.values[i - 1] {
                write_value(w, signal.width, signal.values[i], id)?;
            }
        }
        if trigger_edge {
            write_value(w, 1, (i == trace.trigger_index) as u128, trigger_id)?;
        }
    }
    writeln!(w, "#{}", trace.timestamp(samples))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::DecodedSignal;

    fn dump(trace: &DecodedTrace) -> String {
        let mut out = Vec::new();
        write(trace, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn trace(period: Option<u64>) -> DecodedTrace {
        DecodedTrace {
            signals: vec![
                DecodedSignal {
                    name: "polling".to_string(),
                    width: 1,
                    values: vec![0, 0, 1, 1, 1],
                },
                DecodedSignal {
                    name: "fsm".to_string(),
                    width: 4,
                    values: vec![2, 2, 2, 5, 5],
                },
            ],
            trigger_index: 2,
            sample_period_ps: period,
        }
    }

    #[test]
    fn test_id_codes_unique() {
        let codes: std::collections::HashSet<String> = (0..10_000).map(id_code).collect();
        assert_eq!(codes.len(), 10_000);
        assert_eq!(id_code(0), "!");
        assert_eq!(id_code(93), "~");
    }

    #[test]
    fn test_header() {
        let text = dump(&trace(Some(8000)));
        assert!(text.contains("$timescale 1ps $end"));
        assert!(text.contains("$var wire 1 ! polling $end"));
        assert!(text.contains("$var wire 4 \" fsm [3:0] $end"));
        assert!(text.contains("$var wire 1 # trigger $end"));
        assert!(text.contains("$enddefinitions $end"));
    }

    #[test]
    fn test_only_changes_are_dumped() {
        let text = dump(&trace(Some(8000)));
        let body: Vec<&str> = text
            .split("$enddefinitions $end\n")
            .nth(1)
            .unwrap()
            .lines()
            .collect();
        assert_eq!(
            body,
            vec![
                "#0", "$dumpvars", "0!", "b10 \"", "0#", "$end",
                "#16000", "1!", "1#",
                "#24000", "b101 \"", "0#",
                "#40000",
            ]
        );
    }

    #[test]
    fn test_unknown_period_uses_sample_steps() {
        let text = dump(&trace(None));
        assert!(text.contains("$timescale 1ns $end"));
        assert!(text.contains("\n#2\n"));
        assert!(text.ends_with("#5\n"));
    }
}
