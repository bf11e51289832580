//! Interface de linha de comando do mediaflow baseada em clap.
//!
//! Define a struct [`Cli`] com os subcomandos [`Command`] (prepare, run,
//! status, evict) e a flag global `--verbose`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::orchestrator::ForceRerun;
use crate::state_machine::StageKind;

/// mediaflow: orquestração retomável de pipelines de mídia.
#[derive(Debug, Parser)]
#[command(name = "mediaflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Habilita logs detalhados (equivale a `RUST_LOG=mediaflow=debug`).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria o descritor do job e o layout do diretório de trabalho.
    Prepare {
        /// Diretório de trabalho do job.
        work_dir: PathBuf,

        /// Workflow nomeado (audio, transcribe, subtitle, translate).
        #[arg(long, default_value = "transcribe")]
        workflow: String,

        /// Arquivo(s) de mídia de entrada.
        #[arg(long = "input", required = true)]
        inputs: Vec<PathBuf>,

        /// Overrides de configuração no formato `chave=valor`.
        #[arg(long = "set", value_parser = parse_override)]
        overrides: Vec<(String, String)>,
    },

    /// Executa (ou retoma) os estágios de um job preparado.
    Run {
        /// Diretório de trabalho do job.
        work_dir: PathBuf,

        #[command(flatten)]
        force: ForceArgs,

        /// Arquivo TOML de defaults do sistema.
        #[arg(long)]
        defaults: Option<PathBuf>,
    },

    /// Mostra o manifesto mais recente de cada estágio.
    Status {
        /// Diretório de trabalho do job.
        work_dir: PathBuf,
    },

    /// Remove entradas expiradas do cache e relata o espaço recuperado.
    Evict {
        /// Raiz do cache; sem ela, usa a mesma resolução de `cache.root`.
        #[arg(long)]
        cache_root: Option<PathBuf>,
    },
}

/// Flags mutuamente exclusivas de reexecução forçada.
#[derive(Debug, Args)]
#[group(multiple = false)]
pub struct ForceArgs {
    /// Reexecuta todos os estágios, ignorando manifestos reaproveitáveis.
    #[arg(long)]
    pub force: bool,

    /// Reexecuta a partir do estágio indicado (inclusive).
    #[arg(long, value_name = "STAGE")]
    pub force_from: Option<StageKind>,
}

impl ForceArgs {
    pub fn to_force(&self) -> ForceRerun {
        match (self.force, self.force_from) {
            (_, Some(stage)) => ForceRerun::From(stage),
            (true, None) => ForceRerun::All,
            (false, None) => ForceRerun::None,
        }
    }
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("esperado `chave=valor`, recebido `{raw}`")),
    }
}
