//! Interface de linha de comando do paperflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, resume, status)
//! e flags globais que sobrescrevem valores de `paperflow.toml`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::PipelineConfig;

/// paperflow: executa lotes de artigos por estágios de LLM com checkpoint.
#[derive(Debug, Parser)]
#[command(name = "paperflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = crate::config::CONFIG_FILE)]
    pub config: PathBuf,

    /// Nível de log (error, warn, info, debug, trace). `RUST_LOG` tem precedência.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Número de workers concorrentes.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Habilita o processamento paralelo.
    #[arg(long, global = true, default_value_t = false)]
    pub parallel: bool,

    /// Total de tentativas por item e estágio.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Caminho do arquivo de checkpoint.
    #[arg(long, global = true)]
    pub checkpoint: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Processa um lote desde o início (itens já concluídos são pulados).
    Run {
        /// Arquivo JSON ou TOML com os itens do lote.
        #[arg(long)]
        items: PathBuf,

        /// Mostra o plano sem chamar estágios nem gravar checkpoint.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Retoma um lote a partir do checkpoint.
    Resume {
        /// Arquivo JSON ou TOML com os itens do lote.
        #[arg(long)]
        items: PathBuf,

        /// Reinicia todos os itens a partir deste estágio.
        #[arg(long)]
        from_stage: Option<String>,

        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Mostra o estado atual do checkpoint.
    Status,
}

impl Cli {
    /// Aplica as flags da linha de comando sobre a configuração carregada.
    pub fn apply_overrides(&self, config: &mut PipelineConfig) {
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if self.parallel {
            config.enable_parallel_processing = true;
        }
        if let Some(attempts) = self.max_retries {
            config.retry.attempts = attempts;
        }
        if let Some(path) = &self.checkpoint {
            config.checkpoint_path = path.clone();
        }
        match &self.command {
            Command::Run { dry_run, .. } => {
                config.dry_run |= *dry_run;
            }
            Command::Resume {
                from_stage,
                dry_run,
                ..
            } => {
                config.resume = true;
                config.dry_run |= *dry_run;
                if from_stage.is_some() {
                    config.resume_from_stage = from_stage.clone();
                }
            }
            Command::Status => {}
        }
    }
}
