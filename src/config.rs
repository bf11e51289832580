//! Configuração do mediaflow resolvida por job a partir de quatro camadas.
//!
//! Ordem de prioridade (a primeira que define a chave vence):
//! 1. overrides explícitos do job (`overrides` em `job.json`);
//! 2. arquivo de ambiente do job (`<work_dir>/job.env`);
//! 3. arquivo de defaults do sistema (TOML);
//! 4. constantes embutidas ([`FALLBACK`]).
//!
//! Toda chave é resolvida através da cadeia completa por
//! [`ResolvedConfig::resolve`]. A visão tipada [`JobSettings`] é construída
//! uma vez por job e passada por referência; não há estado global.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::predictor::StageParams;
use crate::state_machine::StageKind;

/// Nome do arquivo de ambiente por job dentro do diretório de trabalho.
pub const JOB_ENV_FILE: &str = "job.env";

/// Caminho padrão do arquivo de defaults do sistema.
pub const SYSTEM_DEFAULTS_PATH: &str = "/etc/mediaflow/defaults.toml";

/// Variável de ambiente que substitui [`SYSTEM_DEFAULTS_PATH`].
pub const SYSTEM_DEFAULTS_ENV: &str = "MEDIAFLOW_DEFAULTS";

/// Constantes embutidas, a última camada da cadeia.
pub const FALLBACK: &[(&str, &str)] = &[
    ("stage.timeout_secs", "3600"),
    ("predictor.enabled", "true"),
    ("predictor.threshold", "0.7"),
    ("predictor.min_samples", "3"),
    ("params.model_size", "medium"),
    ("params.batch_size", "16"),
    ("params.beam_size", "5"),
    ("rerun.output_policy", "version"),
    ("cache.memory_capacity", "256"),
    ("cache.fingerprint_ttl_secs", "2592000"),
    ("cache.history_ttl_secs", "15552000"),
    ("remote.min_interval_ms", "1000"),
    ("remote.max_retries", "2"),
    ("environments.media.packages", "ffmpeg"),
    ("environments.vad.packages", "silero-vad,torch"),
    ("environments.asr.packages", "faster-whisper,ctranslate2"),
    ("environments.translate.packages", "transformers,sentencepiece"),
    ("stages.extract_audio.environment", "media"),
    ("stages.extract_audio.program", "mediaflow-extract-audio"),
    ("stages.extract_audio.args", "{inputs} {output_dir}"),
    ("stages.detect_voice.environment", "vad"),
    ("stages.detect_voice.program", "mediaflow-detect-voice"),
    ("stages.detect_voice.args", "{inputs} {output_dir}"),
    ("stages.transcribe.environment", "asr"),
    ("stages.transcribe.program", "mediaflow-transcribe"),
    (
        "stages.transcribe.args",
        "--model {param.model_size} --batch-size {param.batch_size} --beam-size {param.beam_size} {inputs} {output_dir}",
    ),
    ("stages.translate.environment", "translate"),
    ("stages.translate.program", "mediaflow-translate"),
    ("stages.translate.args", "--beam-size {param.beam_size} {inputs} {output_dir}"),
    ("stages.generate_subtitles.environment", "media"),
    ("stages.generate_subtitles.program", "mediaflow-generate-subtitles"),
    ("stages.generate_subtitles.args", "{inputs} {output_dir}"),
];

/// Camada de origem de um valor de configuração, da mais forte para a mais fraca.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigTier {
    JobOverrides,
    JobEnvFile,
    SystemDefaults,
    Fallback,
}

/// Política aplicada ao diretório de saída existente antes de reexecutar um estágio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Apaga o diretório anterior.
    Replace,
    /// Renomeia o diretório anterior para `<stage>.vNNNN`.
    Version,
}

impl FromStr for OutputPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(OutputPolicy::Replace),
            "version" => Ok(OutputPolicy::Version),
            other => Err(PipelineError::Config(format!(
                "rerun.output_policy must be `replace` or `version`, got `{other}`"
            ))),
        }
    }
}

/// Uma camada plana de chaves pontuadas (`predictor.threshold`) para valores textuais.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLayer {
    pub tier: ConfigTier,
    values: BTreeMap<String, String>,
}

impl ConfigLayer {
    pub fn empty(tier: ConfigTier) -> Self {
        Self {
            tier,
            values: BTreeMap::new(),
        }
    }

    pub fn from_pairs<K, V>(tier: ConfigTier, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tier,
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Camada com as constantes embutidas.
    pub fn fallback() -> Self {
        Self::from_pairs(ConfigTier::Fallback, FALLBACK.iter().copied())
    }

    /// Lê um arquivo `KEY=VALUE`. Arquivo ausente produz camada vazia.
    pub fn from_env_file(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            return Ok(Self::empty(ConfigTier::JobEnvFile));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::parse_env_file(&contents)
    }

    pub fn parse_env_file(contents: &str) -> PipelineResult<Self> {
        let mut values = BTreeMap::new();
        for (idx, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                return Err(PipelineError::Config(format!(
                    "{JOB_ENV_FILE} line {}: expected KEY=VALUE",
                    idx + 1
                )));
            };
            let key = normalize_env_key(key);
            if key.is_empty() {
                return Err(PipelineError::Config(format!(
                    "{JOB_ENV_FILE} line {}: empty key",
                    idx + 1
                )));
            }
            values.insert(key, unquote(value.trim()).to_string());
        }
        Ok(Self {
            tier: ConfigTier::JobEnvFile,
            values,
        })
    }

    /// Lê o arquivo TOML de defaults do sistema. Arquivo ausente produz camada vazia.
    pub fn from_toml_file(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            return Ok(Self::empty(ConfigTier::SystemDefaults));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::parse_toml(&contents)
    }

    pub fn parse_toml(contents: &str) -> PipelineResult<Self> {
        let table = toml::from_str::<toml::Table>(contents)?;
        let mut values = BTreeMap::new();
        flatten_toml("", &table, &mut values)?;
        Ok(Self {
            tier: ConfigTier::SystemDefaults,
            values,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// `PREDICTOR__THRESHOLD` -> `predictor.threshold`
fn normalize_env_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace("__", ".")
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn flatten_toml(
    prefix: &str,
    table: &toml::Table,
    out: &mut BTreeMap<String, String>,
) -> PipelineResult<()> {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten_toml(&full, inner, out)?,
            toml::Value::Array(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    parts.push(toml_scalar(&full, item)?);
                }
                out.insert(full, parts.join(","));
            }
            scalar => {
                let rendered = toml_scalar(&full, scalar)?;
                out.insert(full, rendered);
            }
        }
    }
    Ok(())
}

fn toml_scalar(key: &str, value: &toml::Value) -> PipelineResult<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(d) => Ok(d.to_string()),
        _ => Err(PipelineError::Config(format!(
            "`{key}`: nested arrays and tables inside arrays are not supported"
        ))),
    }
}

/// Valor resolvido com a camada que o forneceu; é o que vai para o manifesto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue {
    pub value: String,
    pub source: ConfigTier,
}

/// As quatro camadas, ordenadas da mais forte para a mais fraca.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    layers: Vec<ConfigLayer>,
}

impl ResolvedConfig {
    pub fn new(
        overrides: ConfigLayer,
        job_env: ConfigLayer,
        system: ConfigLayer,
        fallback: ConfigLayer,
    ) -> Self {
        let mut layers = vec![overrides, job_env, system, fallback];
        layers.sort_by_key(|l| l.tier);
        Self { layers }
    }

    /// Monta a cadeia completa para um job.
    pub fn load(
        overrides: &BTreeMap<String, String>,
        work_dir: &Path,
        system_defaults: &Path,
    ) -> PipelineResult<Self> {
        let overrides = ConfigLayer::from_pairs(
            ConfigTier::JobOverrides,
            overrides.iter().map(|(k, v)| (k.clone(), v.clone())),
        );
        let job_env = ConfigLayer::from_env_file(&work_dir.join(JOB_ENV_FILE))?;
        let system = ConfigLayer::from_toml_file(system_defaults)?;
        Ok(Self::new(overrides, job_env, system, ConfigLayer::fallback()))
    }

    /// Percorre todas as camadas em ordem; a primeira que define a chave vence.
    pub fn resolve(&self, key: &str) -> Option<(&str, ConfigTier)> {
        self.layers
            .iter()
            .find_map(|layer| layer.get(key).map(|v| (v, layer.tier)))
    }

    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.resolve(key).map(|(v, _)| v)
    }

    pub fn get(&self, key: &str) -> PipelineResult<&str> {
        self.get_opt(key)
            .ok_or_else(|| PipelineError::Config(format!("missing key `{key}` in every tier")))
    }

    pub fn get_parsed<T>(&self, key: &str) -> PipelineResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get(key)?;
        raw.trim()
            .parse::<T>()
            .map_err(|e| PipelineError::Config(format!("`{key}` = `{raw}`: {e}")))
    }

    pub fn get_parsed_opt<T>(&self, key: &str) -> PipelineResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_opt(key) {
            Some(_) => self.get_parsed(key).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_bool(&self, key: &str) -> PipelineResult<bool> {
        let raw = self.get(key)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(PipelineError::Config(format!(
                "`{key}` = `{raw}` is not a boolean"
            ))),
        }
    }

    /// Lista separada por vírgulas; ausente vira lista vazia.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_opt(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Todas as chaves conhecidas em qualquer camada.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.layers.iter().flat_map(|l| l.keys()).collect()
    }

    /// Segmentos imediatamente abaixo de `prefix` (`environments.` -> `asr`, `vad`, ...).
    pub fn children(&self, prefix: &str) -> BTreeSet<String> {
        let prefix = format!("{prefix}.");
        self.keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split('.').next())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Fotografia pós-merge de todas as chaves com a origem de cada valor.
    pub fn snapshot(&self) -> BTreeMap<String, ConfigValue> {
        self.keys()
            .into_iter()
            .filter_map(|key| {
                self.resolve(key).map(|(value, source)| {
                    (
                        key.to_string(),
                        ConfigValue {
                            value: value.to_string(),
                            source,
                        },
                    )
                })
            })
            .collect()
    }
}

/// Configurações tipadas e imutáveis de um job.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub default_timeout: Duration,
    pub stage_timeouts: BTreeMap<StageKind, Duration>,
    pub predictor_enabled: bool,
    pub predictor_threshold: f64,
    pub predictor_min_samples: u32,
    pub default_params: StageParams,
    pub output_policy: OutputPolicy,
    pub cache_root: PathBuf,
    pub curated_root: Option<PathBuf>,
    pub memory_capacity: usize,
    pub fingerprint_ttl: Duration,
    pub history_ttl: Duration,
    pub remote_min_interval: Duration,
    /// Novas tentativas após falhas transitórias (429, rede, 5xx).
    pub remote_max_retries: u32,
    pub remote_base_url: Option<String>,
    pub extra_inputs: BTreeMap<StageKind, Vec<PathBuf>>,
}

impl JobSettings {
    pub fn from_resolved(config: &ResolvedConfig, work_dir: &Path) -> PipelineResult<Self> {
        let default_timeout = Duration::from_secs(config.get_parsed("stage.timeout_secs")?);

        let mut stage_timeouts = BTreeMap::new();
        let mut extra_inputs = BTreeMap::new();
        for kind in StageKind::ALL {
            let key = format!("stages.{}.timeout_secs", kind.name());
            if let Some(secs) = config.get_parsed_opt::<u64>(&key)? {
                stage_timeouts.insert(kind, Duration::from_secs(secs));
            }
            let extras: Vec<PathBuf> = config
                .get_list(&format!("stages.{}.extra_inputs", kind.name()))
                .into_iter()
                .map(|p| work_dir.join(p))
                .collect();
            if !extras.is_empty() {
                extra_inputs.insert(kind, extras);
            }
        }

        let predictor_threshold: f64 = config.get_parsed("predictor.threshold")?;
        if !(0.0..=1.0).contains(&predictor_threshold) {
            return Err(PipelineError::Config(format!(
                "predictor.threshold must be within [0, 1], got {predictor_threshold}"
            )));
        }

        let default_params = StageParams {
            model_size: config.get("params.model_size")?.to_string(),
            batch_size: config.get_parsed("params.batch_size")?,
            beam_size: config.get_parsed("params.beam_size")?,
        };

        let cache_root = match config.get_opt("cache.root") {
            Some(root) => PathBuf::from(root),
            None => default_cache_root(work_dir),
        };

        Ok(Self {
            default_timeout,
            stage_timeouts,
            predictor_enabled: config.get_bool("predictor.enabled")?,
            predictor_threshold,
            predictor_min_samples: config.get_parsed("predictor.min_samples")?,
            default_params,
            output_policy: config.get_parsed("rerun.output_policy")?,
            cache_root,
            curated_root: config.get_opt("cache.curated_root").map(PathBuf::from),
            memory_capacity: config.get_parsed("cache.memory_capacity")?,
            fingerprint_ttl: Duration::from_secs(
                config.get_parsed("cache.fingerprint_ttl_secs")?,
            ),
            history_ttl: Duration::from_secs(config.get_parsed("cache.history_ttl_secs")?),
            remote_min_interval: Duration::from_millis(
                config.get_parsed("remote.min_interval_ms")?,
            ),
            remote_max_retries: config.get_parsed("remote.max_retries")?,
            remote_base_url: config.get_opt("remote.base_url").map(str::to_string),
            extra_inputs,
        })
    }

    pub fn timeout_for(&self, stage: StageKind) -> Duration {
        self.stage_timeouts
            .get(&stage)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

fn default_cache_root(work_dir: &Path) -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".cache").join("mediaflow"),
        _ => work_dir.join(".cache"),
    }
}

/// Escolhe o arquivo de defaults: flag explícita, depois variável de ambiente, depois o padrão.
pub fn system_defaults_path(flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    match std::env::var_os(SYSTEM_DEFAULTS_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(SYSTEM_DEFAULTS_PATH),
    }
}
