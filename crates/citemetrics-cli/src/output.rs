use std::io::Write;

use citemetrics_core::{ItemState, ProgressEvent, RunSummary, SweepReport};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// Install the log subscriber on stderr. `RUST_LOG` filters (default
/// `info`); `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.trim().eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn shorten(title: &str) -> String {
    if title.chars().count() > 60 {
        let cut: String = title.chars().take(60).collect();
        format!("{cut}...")
    } else {
        title.to_string()
    }
}

/// Print a real-time progress event.
pub fn print_progress(
    w: &mut dyn Write,
    event: &ProgressEvent,
    color: ColorMode,
) -> std::io::Result<()> {
    match event {
        ProgressEvent::AlreadyFresh { author_id } => {
            let msg = format!("{author_id}: data is already fresh, nothing to do");
            if color.enabled() {
                writeln!(w, "{}", msg.green())?;
            } else {
                writeln!(w, "{msg}")?;
            }
        }
        ProgressEvent::ProfileLoaded {
            name,
            coauthors,
            publications,
        } => {
            writeln!(
                w,
                "Enriching {name}: {coauthors} coauthors, {publications} publications"
            )?;
        }
        ProgressEvent::Coauthor { index, total, name } => {
            writeln!(w, "[coauthor {}/{}] {}", index + 1, total, name)?;
        }
        ProgressEvent::Publication {
            index,
            total,
            title,
            state: ItemState::Pending,
        } => {
            let prefix = format!("[{}/{}]", index + 1, total);
            if color.enabled() {
                writeln!(w, "{} \"{}\"", prefix.dimmed(), shorten(title))?;
            } else {
                writeln!(w, "{prefix} \"{}\"", shorten(title))?;
            }
        }
        ProgressEvent::Publication { .. } => {}
    }
    Ok(())
}

/// Print the end-of-run summary.
pub fn print_summary(w: &mut dyn Write, summary: &RunSummary, color: ColorMode) -> std::io::Result<()> {
    writeln!(w)?;
    if color.enabled() {
        writeln!(w, "{}", "Summary".bold())?;
    } else {
        writeln!(w, "Summary")?;
    }
    writeln!(w, "  Coauthors:          {}", summary.coauthors)?;
    writeln!(w, "  Publications:       {}", summary.publications)?;
    writeln!(w, "  Resumed:            {}", summary.resumed)?;
    if color.enabled() {
        writeln!(w, "  DOIs resolved:      {}", summary.dois_resolved.green())?;
    } else {
        writeln!(w, "  DOIs resolved:      {}", summary.dois_resolved)?;
    }
    writeln!(w, "  DOIs reused:        {}", summary.dois_reused)?;
    if color.enabled() && summary.dois_missing > 0 {
        writeln!(w, "  DOIs missing:       {}", summary.dois_missing.yellow())?;
    } else {
        writeln!(w, "  DOIs missing:       {}", summary.dois_missing)?;
    }
    writeln!(w, "  Conference skipped: {}", summary.conference_skipped)?;
    writeln!(w, "  Metrics found:      {}", summary.metrics_found)?;
    if summary.save_failures > 0 {
        let msg = format!("  Save failures:      {}", summary.save_failures);
        if color.enabled() {
            writeln!(w, "{}", msg.red())?;
        } else {
            writeln!(w, "{msg}")?;
        }
    }
    Ok(())
}

/// Print a revalidation sweep report.
pub fn print_sweep_report(w: &mut dyn Write, report: &SweepReport, color: ColorMode) -> std::io::Result<()> {
    writeln!(w, "Refreshed: {}", report.refreshed)?;
    writeln!(w, "Skipped:   {}", report.skipped)?;
    if color.enabled() && report.blocked > 0 {
        writeln!(w, "Blocked:   {}", report.blocked.yellow())?;
    } else {
        writeln!(w, "Blocked:   {}", report.blocked)?;
    }
    if report.scholar_disabled {
        let msg = "Google Scholar blocked this sweep and was skipped after the first block";
        if color.enabled() {
            writeln!(w, "{}", msg.red())?;
        } else {
            writeln!(w, "{msg}")?;
        }
    }
    Ok(())
}
