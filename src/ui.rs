//! Interface de terminal do paperflow: spinner e relatórios coloridos.
//!
//! Usa `indicatif` para o spinner enquanto o lote roda e `console` para
//! destacar itens concluídos (verde), falhos (vermelho) e retentados (amarelo).

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{Checkpoint, CheckpointStats, ItemOutcome};
use crate::orchestrator::RunReport;

/// Spinner exibido enquanto um lote é processado.
pub struct RunProgress {
    pb: ProgressBar,
}

impl RunProgress {
    /// Inicia o spinner com uma descrição do lote.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) =
            ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]")
        {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb }
    }

    /// Remove o spinner antes de imprimir o relatório.
    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }
}

/// Formata o relatório final de uma execução.
pub fn render_report(report: &RunReport) -> String {
    let p = Palette::new();
    let mut out = Vec::new();

    if report.dry_run {
        out.push(format!(
            "{} Dry run {}: {} stage executions planned",
            p.yellow.apply_to("○"),
            p.dim.apply_to(report.run_id),
            report.planned()
        ));
        for stage in &report.stages {
            out.push(format!(
                "  {:<16} {} planned, {} already done",
                stage.stage, stage.summary.planned, stage.summary.skipped
            ));
        }
        return out.join("\n");
    }

    out.push(format!("Run {}", p.dim.apply_to(report.run_id)));
    for stage in &report.stages {
        let s = &stage.summary;
        out.push(format!(
            "  {:<16} {} ok  {} failed  {} skipped  {} retried",
            stage.stage, s.completed, s.failed, s.skipped, s.retried
        ));
    }
    out.push(format!(
        "  {} {} completed",
        p.green.apply_to("✓"),
        report.completed
    ));
    if report.retried > 0 {
        out.push(format!(
            "  {} {} needed retries",
            p.yellow.apply_to("↻"),
            report.retried
        ));
    }
    if report.failed > 0 {
        out.push(format!("  {} {} failed", p.red.apply_to("✗"), report.failed));
        for f in &report.failures {
            let class = f.class.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
            out.push(format!("      {} [{}] {}: {}", f.id, f.stage, class, f.error));
        }
    }
    if report.in_progress > 0 {
        out.push(format!(
            "  {} {} still in progress",
            p.yellow.apply_to("…"),
            report.in_progress
        ));
    }
    if report.cancelled {
        out.push(format!("  {} run cancelled, resume to continue", p.yellow.apply_to("!")));
    }
    if let Some(q) = report.quota {
        out.push(format!(
            "  {}",
            p.dim
                .apply_to(format!("quota: {} calls, {} throttled", q.consumed, q.throttled))
        ));
    }
    out.join("\n")
}

/// Formata o resumo do checkpoint para o comando `status`.
pub fn render_status(checkpoint: &Checkpoint) -> String {
    let p = Palette::new();
    let CheckpointStats {
        completed,
        failed,
        in_progress,
        total_retries,
    } = checkpoint.stats();

    let mut out = vec![
        format!("Run {}", p.dim.apply_to(checkpoint.run_id)),
        format!("  {} {completed} completed", p.green.apply_to("✓")),
        format!("  {} {in_progress} in progress", p.yellow.apply_to("…")),
        format!("  {} {failed} failed", p.red.apply_to("✗")),
        format!("  {} {total_retries} retries", p.yellow.apply_to("↻")),
    ];
    for (id, status) in checkpoint.failed_items() {
        out.push(format!(
            "      {id} [{}]: {}",
            status.current_stage.as_deref().unwrap_or("-"),
            status.last_error.as_deref().unwrap_or("")
        ));
    }
    for (id, status) in &checkpoint.items {
        if status.outcome == ItemOutcome::InProgress {
            out.push(format!(
                "      {id} waiting on {}",
                status.current_stage.as_deref().unwrap_or("first stage")
            ));
        }
    }
    out.join("\n")
}
