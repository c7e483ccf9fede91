//! Human-readable text output

use crate::coordinator::RunReport;
use crate::diskutil::render_report;
use crate::worker::{OpStats, WorkerStats};
use std::fmt::Write;
use std::time::Duration;

/// Render the run report the way it is printed to the console
pub fn render_results(report: &RunReport) -> String {
    let mut out = String::new();
    // writing to a String cannot fail
    let _ = write_results(&mut out, report);
    out
}

/// Print the run report to stdout
pub fn print_results(report: &RunReport) {
    print!("{}", render_results(report));
}

fn write_results(out: &mut String, report: &RunReport) -> std::fmt::Result {
    writeln!(out, "═══════════════════════════════════════════════════════════")?;
    writeln!(out, "                    RUN RESULTS")?;
    writeln!(out, "═══════════════════════════════════════════════════════════")?;
    writeln!(out)?;
    writeln!(out, "Started:      {}", report.started)?;
    writeln!(out, "Elapsed Time: {:.3}s", report.elapsed_secs)?;
    writeln!(out, "Seed:         {}", report.seed)?;
    writeln!(out, "Targets:      {}", report.targets.len())?;
    writeln!(out)?;

    let layout = &report.layout;
    writeln!(out, "Layout:")?;
    writeln!(out, "  IO window:      {}", format_bytes(layout.total_io))?;
    writeln!(
        out,
        "  Files extended: {} ({})",
        layout.files_extended,
        format_bytes(layout.bytes_extended)
    )?;
    if layout.cancelled {
        writeln!(out, "  Layout was cancelled; affected targets were skipped")?;
    }
    writeln!(out)?;

    write_totals(out, &report.total, report.elapsed_secs)?;

    if report.workers.len() > 1 {
        writeln!(out, "Per worker:")?;
        for w in &report.workers {
            writeln!(
                out,
                "  worker {}: read {} ops, write {} ops, {} errors, {} verify failures",
                w.worker,
                format_number(w.read.ops),
                format_number(w.write.ops),
                w.errors,
                w.verify.failures()
            )?;
        }
        writeln!(out)?;
    }

    if !report.disks.is_empty() {
        write!(out, "{}", render_report(&report.disks))?;
        writeln!(out)?;
    }
    writeln!(out, "═══════════════════════════════════════════════════════════")
}

fn write_totals(out: &mut String, total: &WorkerStats, secs: f64) -> std::fmt::Result {
    writeln!(out, "Operations:")?;
    write_op_line(out, "Read: ", &total.read, secs)?;
    write_op_line(out, "Write:", &total.write, secs)?;
    if total.fsyncs > 0 {
        writeln!(out, "  Fsync: {}", format_number(total.fsyncs))?;
    }
    if total.errors > 0 {
        writeln!(out, "  Errors: {}", format_number(total.errors))?;
    }
    if total.short_reads > 0 {
        writeln!(out, "  Short reads: {}", format_number(total.short_reads))?;
    }
    if total.stopped_early {
        writeln!(out, "  Stopped early")?;
    }
    writeln!(out)?;

    let v = &total.verify;
    if v.blocks_populated > 0 || v.buffers_verified > 0 {
        writeln!(out, "Verification:")?;
        writeln!(out, "  Blocks written:  {}", format_number(v.blocks_populated))?;
        writeln!(out, "  Blocks verified: {}", format_number(v.blocks_verified))?;
        writeln!(out, "  Mismatches:      {}", format_number(v.blocks_mismatched))?;
        if v.corrupt_headers > 0 {
            writeln!(out, "  Corrupt headers: {}", format_number(v.corrupt_headers))?;
        }
        if v.untracked_reads > 0 {
            writeln!(out, "  Untracked reads: {}", format_number(v.untracked_reads))?;
        }
        let checked = v.blocks_verified + v.corrupt_headers;
        if checked > 0 {
            let ok = checked.saturating_sub(v.blocks_mismatched + v.corrupt_headers);
            writeln!(out, "  Success:         {:.2}%", ok as f64 * 100.0 / checked as f64)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_op_line(out: &mut String, label: &str, op: &OpStats, secs: f64) -> std::fmt::Result {
    let (iops, rate) = if secs > 0.0 {
        (op.ops as f64 / secs, op.bytes as f64 / secs)
    } else {
        (0.0, 0.0)
    };
    writeln!(
        out,
        "  {} {} ops ({}) - {:.0} IOPS, {}/s",
        label,
        format_number(op.ops),
        format_bytes(op.bytes),
        iops,
        format_bytes(rate as u64)
    )?;
    if op.latency.is_empty() {
        return Ok(());
    }
    let lat = &op.latency;
    writeln!(
        out,
        "         lat avg {}, p50 {}, p99 {}, p99.9 {}, max {}",
        format_latency(lat.mean()),
        format_latency(lat.percentile(50.0)),
        format_latency(lat.percentile(99.0)),
        format_latency(lat.percentile(99.9)),
        format_latency(lat.max())
    )
}

fn format_latency(d: Option<Duration>) -> String {
    let Some(d) = d else {
        return "-".to_string();
    };
    let us = d.as_nanos() as f64 / 1000.0;
    if us >= 1_000_000.0 {
        format!("{:.2}s", us / 1_000_000.0)
    } else if us >= 1000.0 {
        format!("{:.2}ms", us / 1000.0)
    } else {
        format!("{:.1}us", us)
    }
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// Format bytes with binary units
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
