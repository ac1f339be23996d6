//! Configuração do paperflow carregada a partir de `paperflow.toml`.
//!
//! A struct [`PipelineConfig`] enumera todas as opções reconhecidas.
//! Valores ausentes no arquivo usam defaults sensatos, e [`PipelineConfig::validate`]
//! é chamado uma única vez na inicialização.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::retry::{RetryMode, RetryPolicy};

/// Nome padrão do arquivo de configuração.
pub const CONFIG_FILE: &str = "paperflow.toml";

/// Configuração de nível superior carregada de `paperflow.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Número de workers concorrentes quando o processamento paralelo está ativo.
    pub max_workers: usize,

    /// Processamento paralelo exige opt-in explícito.
    pub enable_parallel_processing: bool,

    /// Limita a taxa de chamadas externas com um token bucket.
    pub enable_quota_management: bool,

    /// Usa o classificador de erros para decidir retentativas.
    /// Desligado, toda falha é retentada até esgotar `retry.attempts`.
    pub enable_smart_retry: bool,

    pub retry: RetrySettings,

    pub quota: QuotaSettings,

    /// Caminho do arquivo de checkpoint.
    pub checkpoint_path: PathBuf,

    /// Valida e mostra o plano sem executar estágios nem gravar checkpoint.
    pub dry_run: bool,

    /// Recarrega o checkpoint e continua de onde cada item parou.
    pub resume: bool,

    /// Força o reinício a partir deste estágio.
    pub resume_from_stage: Option<String>,

    /// Estágios, na ordem de execução.
    pub stages: Vec<StageSettings>,

    pub llm: LlmSettings,
}

/// Parâmetros do backoff exponencial.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total de tentativas, incluindo a primeira.
    pub attempts: u32,
    /// Atraso base em segundos.
    pub base_delay: f64,
    pub backoff_factor: f64,
    /// Atraso máximo em segundos.
    pub max_delay: f64,
    pub enable_jitter: bool,
    /// Retenta erros não classificados (desligado por padrão).
    pub retry_unknown: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: 1.0,
            backoff_factor: 2.0,
            max_delay: 60.0,
            enable_jitter: true,
            retry_unknown: false,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts,
            base_delay: Duration::from_secs_f64(self.base_delay.max(0.0)),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_secs_f64(self.max_delay.max(0.0)),
            jitter: self.enable_jitter,
        }
    }
}

/// Limite de taxa: `rate` chamadas a cada `period_seconds`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub rate: f64,
    pub period_seconds: f64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            rate: 60.0,
            period_seconds: 60.0,
        }
    }
}

impl QuotaSettings {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_seconds.max(0.0))
    }
}

/// Um estágio nomeado executado pelo LLM.
#[derive(Debug, Clone, Deserialize)]
pub struct StageSettings {
    pub name: String,
    /// Template do prompt; `{id}` e `{payload}` são substituídos por item.
    pub prompt: String,
}

/// Parâmetros do cliente LLM usado pelos estágios.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    /// Sobrescreve a URL da API (útil em testes).
    pub base_url: Option<String>,
    /// Diretório onde as respostas de cada estágio são gravadas.
    pub output_dir: Option<PathBuf>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 4096,
            base_url: None,
            output_dir: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            enable_parallel_processing: false,
            enable_quota_management: true,
            enable_smart_retry: true,
            retry: RetrySettings::default(),
            quota: QuotaSettings::default(),
            checkpoint_path: PathBuf::from("paperflow-checkpoint.json"),
            dry_run: false,
            resume: false,
            resume_from_stage: None,
            stages: Vec::new(),
            llm: LlmSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Carrega a configuração de `paperflow.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de `path`, ou os defaults se ele não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<PipelineConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave da API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.llm.api_key = key;
        }

        Ok(config)
    }

    pub fn retry_mode(&self) -> RetryMode {
        if self.enable_smart_retry {
            RetryMode::Smart {
                retry_unknown: self.retry.retry_unknown,
            }
        } else {
            RetryMode::Blind
        }
    }

    /// Verifica todas as opções de uma vez; qualquer violação é fatal.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers < 1 {
            return Err(PipelineError::config("max_workers must be at least 1"));
        }

        let r = &self.retry;
        if r.attempts < 1 {
            return Err(PipelineError::config("retry.attempts must be at least 1"));
        }
        if !(r.base_delay.is_finite() && r.base_delay >= 0.0) {
            return Err(PipelineError::config("retry.base_delay must be >= 0"));
        }
        if !(r.backoff_factor.is_finite() && r.backoff_factor >= 1.0) {
            return Err(PipelineError::config("retry.backoff_factor must be >= 1"));
        }
        if !(r.max_delay.is_finite() && r.max_delay >= r.base_delay) {
            return Err(PipelineError::config(
                "retry.max_delay must be >= retry.base_delay",
            ));
        }

        let q = &self.quota;
        if !(q.rate.is_finite() && q.rate > 0.0) {
            return Err(PipelineError::config("quota.rate must be > 0"));
        }
        if !(q.period_seconds.is_finite() && q.period_seconds > 0.0) {
            return Err(PipelineError::config("quota.period_seconds must be > 0"));
        }

        let dir = match self.checkpoint_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        if !dir.is_dir() {
            return Err(PipelineError::config(format!(
                "checkpoint directory {} does not exist",
                dir.display()
            )));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(PipelineError::config("stage names must not be empty"));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
        }
        if let Some(stage) = &self.resume_from_stage
            && !names.contains(stage.as_str())
        {
            return Err(PipelineError::UnknownStage(stage.clone()));
        }

        Ok(())
    }
}
