//! Interface de terminal do mediaflow: spinner por estágio e saída colorida.
//!
//! Usa `indicatif` para o spinner e `console` para as cores. O
//! [`TerminalProgress`] implementa [`StageObserver`] e acompanha um run
//! estágio a estágio.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::manifest::Manifest;
use crate::orchestrator::StageObserver;
use crate::state_machine::{JobResult, JobStatus, StageFailure, StageKind, StageReport, StageStatus};

/// Indicador visual de progresso para um run no terminal.
///
/// Estágios executados aparecem em verde, reaproveitados em ciano e
/// falhas em vermelho, com o caminho do log.
pub struct TerminalProgress {
    pb: ProgressBar,
    green: Style,
    cyan: Style,
    red: Style,
    yellow: Style,
}

impl TerminalProgress {
    /// Inicia o spinner com a descrição do job.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("INIT: {description}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            cyan: Style::new().cyan(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }
}

/// Cabeçalho colorido pelo status seguido do resultado do run em JSON.
pub fn render_result(result: &JobResult) -> String {
    let style = match result.status {
        JobStatus::Succeeded => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
        JobStatus::Interrupted => Style::new().yellow(),
    };
    format!(
        "{}\n{}",
        style.apply_to("─── Job Result ───"),
        serde_json::to_string_pretty(result).unwrap_or_default()
    )
}

/// Imprime o resultado estruturado do run em stdout.
pub fn print_result(result: &JobResult) {
    println!();
    println!("{}", render_result(result));
}

impl StageObserver for TerminalProgress {
    fn stage_started(&self, stage: StageKind, index: usize, total: usize) {
        self.pb.set_message(format!("[{}/{}] {stage}", index + 1, total));
    }

    fn stage_finished(&self, report: &StageReport) {
        let (mark, style) = match report.status {
            StageStatus::Skipped => ("↺", &self.cyan),
            _ => ("✓", &self.green),
        };
        self.pb.println(format!(
            "  {} {} {} ({} ms)",
            style.apply_to(mark),
            report.stage,
            report.status,
            report.elapsed_ms
        ));
    }

    fn stage_failed(&self, report: &StageReport, failure: &StageFailure) {
        self.pb.println(format!(
            "  {} {} {}: {}",
            self.red.apply_to("✗"),
            report.stage,
            failure.kind,
            failure.message
        ));
        self.pb
            .println(format!("    log: {}", failure.log_path.display()));
    }

    fn run_finished(&self, result: &JobResult) {
        self.pb.finish_and_clear();
        match result.status {
            JobStatus::Succeeded => println!(
                "  {} Job {} concluído ({} estágios executados)",
                self.green.apply_to("✓"),
                result.job_id,
                result.dispatch_count()
            ),
            JobStatus::Failed => println!("  {} Job {} falhou", self.red.apply_to("✗"), result.job_id),
            JobStatus::Interrupted => {
                println!("  {} Job {} interrompido", self.yellow.apply_to("■"), result.job_id)
            }
        }
    }
}

/// Formata uma linha de status para um manifesto, usada por `mediaflow status`.
pub fn manifest_line(manifest: &Manifest) -> String {
    let status = match manifest.status {
        StageStatus::Success => Style::new().green().apply_to(manifest.status),
        StageStatus::Skipped => Style::new().cyan().apply_to(manifest.status),
        StageStatus::Failed => Style::new().red().apply_to(manifest.status),
        _ => Style::new().yellow().apply_to(manifest.status),
    };
    let mut line = format!(
        "{:<20} v{:04} {:<8} {} saída(s)",
        manifest.stage.name(),
        manifest.version,
        status,
        manifest.outputs.len()
    );
    if let Some(from) = manifest.resumed_from {
        line.push_str(&format!(" (reaproveitado de v{from:04})"));
    }
    if let Some(error) = &manifest.error {
        line.push_str(&format!(" [{}] {}", error.kind, error.message));
    }
    line
}
