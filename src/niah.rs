//! Needle-In-A-Haystack benchmark under head sparsification
//!
//! Four stages, each reading the previous stage's output from `output_dir`:
//!
//! - **prompt**: build one prompt per (context length, needle depth) cell by
//!   hiding a needle sentence in a haystack of text files. Writes `prompts.json`.
//! - **pred**: generate an answer for every prompt, once per requested `k`
//!   (and once without sparsification). Writes `pred_{run}.json`.
//! - **eval**: score answers by the fraction of answer keywords they contain.
//!   Writes `results.json`, keyed by task and run.
//! - **vis**: render a depth × length score grid per run to `heatmap_{run}.txt`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::instrument::RecordSite;
use crate::model::ShipModel;
use crate::recorder::{Phase, RetentionPolicy};
use crate::sparsity::HeadMetric;

/// Benchmark configuration, read from a JSON file
///
/// Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NiahConfig {
    /// HuggingFace model ID
    pub model: String,
    /// Task name, the top-level key of `results.json`
    pub task: String,
    pub output_dir: PathBuf,
    pub prompt: PromptConfig,
    pub pred: PredConfig,
    pub eval: EvalConfig,
}

impl Default for NiahConfig {
    fn default() -> Self {
        Self {
            model: "Qwen/Qwen2.5-0.5B-Instruct".to_string(),
            task: "niah".to_string(),
            output_dir: PathBuf::from("outputs/niah"),
            prompt: PromptConfig::default(),
            pred: PredConfig::default(),
            eval: EvalConfig::default(),
        }
    }
}

/// Haystack construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Directory of `.txt` files concatenated (in name order) into the haystack
    pub haystack_dir: PathBuf,
    pub needle: String,
    pub retrieval_question: String,
    /// Prompt text with `{context}` and `{question}` placeholders
    pub template: String,
    pub context_lengths_min: usize,
    pub context_lengths_max: usize,
    pub context_lengths_num_intervals: usize,
    pub document_depth_percent_min: f64,
    pub document_depth_percent_max: f64,
    pub document_depth_percent_intervals: usize,
    /// Tokens reserved for the template, question and answer
    pub final_context_buffer: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            haystack_dir: PathBuf::from("haystack"),
            needle: "\nThe best thing to do in San Francisco is eat a sandwich and sit in \
                     Dolores Park on a sunny day.\n"
                .to_string(),
            retrieval_question: "What is the best thing to do in San Francisco?".to_string(),
            template: "This is a very long story book: <book> {context} </book>.\n\
                       Based on the content of the book, Question: {question}\nAnswer:"
                .to_string(),
            context_lengths_min: 1000,
            context_lengths_max: 8000,
            context_lengths_num_intervals: 8,
            document_depth_percent_min: 0.0,
            document_depth_percent_max: 100.0,
            document_depth_percent_intervals: 5,
            final_context_buffer: 200,
        }
    }
}

/// Generation runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredConfig {
    /// One sparsified run per value
    pub k_values: Vec<i64>,
    pub metric: HeadMetric,
    pub allow_during_prefill: bool,
    /// Also run without sparsification (`full`)
    pub include_full: bool,
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub use_chat_template: bool,
    /// Layers whose attention weights are dumped per prompt
    pub record_layers: Vec<usize>,
    pub record_policy: RetentionPolicy,
}

impl Default for PredConfig {
    fn default() -> Self {
        Self {
            k_values: vec![3],
            metric: HeadMetric::L2,
            allow_during_prefill: false,
            include_full: true,
            max_new_tokens: 50,
            temperature: 0.0,
            use_chat_template: true,
            record_layers: Vec::new(),
            record_policy: RetentionPolicy::First,
        }
    }
}

/// Scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Case-insensitive keywords a correct answer contains
    pub answer_keywords: Vec<String>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            answer_keywords: vec!["sandwich".to_string(), "dolores park".to_string()],
        }
    }
}

impl NiahConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.prompt;
        if p.context_lengths_min > p.context_lengths_max {
            bail!(
                "context_lengths_min {} exceeds context_lengths_max {}",
                p.context_lengths_min,
                p.context_lengths_max
            );
        }
        if p.context_lengths_num_intervals == 0 || p.document_depth_percent_intervals == 0 {
            bail!("grid intervals must be at least 1");
        }
        let depth_ok = |d: f64| (0.0..=100.0).contains(&d);
        if !depth_ok(p.document_depth_percent_min)
            || !depth_ok(p.document_depth_percent_max)
            || p.document_depth_percent_min > p.document_depth_percent_max
        {
            bail!("document depth range must lie within 0..=100");
        }
        if !p.template.contains("{context}") {
            bail!("prompt template has no {{context}} placeholder");
        }
        if let Some(k) = self.pred.k_values.iter().find(|k| **k < 0) {
            bail!("k_values must not be negative (got {k})");
        }
        if self.pred.k_values.is_empty() && !self.pred.include_full {
            bail!("no runs configured: k_values is empty and include_full is false");
        }
        if self.eval.answer_keywords.is_empty() {
            bail!("answer_keywords must not be empty");
        }
        Ok(())
    }

    /// Context lengths of the grid, ascending and distinct
    pub fn context_lengths(&self) -> Vec<usize> {
        let p = &self.prompt;
        let mut lengths: Vec<usize> = linear_grid(
            p.context_lengths_min as f64,
            p.context_lengths_max as f64,
            p.context_lengths_num_intervals,
        )
        .into_iter()
        .map(|x| x.round() as usize)
        .collect();
        lengths.dedup();
        lengths
    }

    /// Needle depths of the grid, in percent
    pub fn depth_percents(&self) -> Vec<f64> {
        let p = &self.prompt;
        linear_grid(
            p.document_depth_percent_min,
            p.document_depth_percent_max,
            p.document_depth_percent_intervals,
        )
    }

    /// Runs of the pred stage, sparsified ones first
    pub fn runs(&self) -> Vec<RunSpec> {
        let mut runs: Vec<RunSpec> = self
            .pred
            .k_values
            .iter()
            .map(|&k| RunSpec {
                name: format!("k{k}"),
                k: Some(k),
            })
            .collect();
        if self.pred.include_full {
            runs.push(RunSpec {
                name: "full".to_string(),
                k: None,
            });
        }
        runs
    }

    pub fn prompts_path(&self) -> PathBuf {
        self.output_dir.join("prompts.json")
    }

    pub fn pred_path(&self, run: &str) -> PathBuf {
        self.output_dir.join(format!("pred_{run}.json"))
    }

    pub fn results_path(&self) -> PathBuf {
        self.output_dir.join("results.json")
    }

    pub fn heatmap_path(&self, run: &str) -> PathBuf {
        self.output_dir.join(format!("heatmap_{run}.txt"))
    }

    fn recording_path(&self, run: &str, prompt_idx: usize, phase: Phase) -> PathBuf {
        self.output_dir
            .join("recordings")
            .join(run)
            .join(format!("{prompt_idx:04}_{phase}.safetensors"))
    }
}

/// `n` evenly spaced points from `min` to `max` inclusive
pub fn linear_grid(min: f64, max: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let step = (max - min) / (n - 1) as f64;
            (0..n).map(|i| min + step * i as f64).collect()
        }
    }
}

/// One generation run: sparsified with `k` heads, or full attention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub k: Option<i64>,
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prompt,
    Pred,
    Eval,
    Vis,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Prompt, Stage::Pred, Stage::Eval, Stage::Vis];
}

/// Tokenizer view used to size and cut the haystack
pub trait ContextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

impl ContextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self)
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }
}

/// Concatenate every `.txt` file of `dir` in name order
pub fn load_haystack(dir: &Path) -> Result<String> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read haystack directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    files.sort();
    if files.is_empty() {
        bail!("no .txt files in haystack directory {}", dir.display());
    }

    let mut haystack = String::new();
    for file in &files {
        let text = fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        haystack.push_str(&text);
    }
    info!("Loaded haystack from {} file(s)", files.len());
    Ok(haystack)
}

/// Hide `needle` at `depth_percent` of the first tokens of `haystack`
///
/// The haystack is cut so haystack plus needle fit in `budget` tokens. The
/// insertion point moves back to just after the previous sentence end (a token
/// of `period_tokens`); depth 100 appends the needle.
pub fn insert_needle(
    haystack: &[u32],
    needle: &[u32],
    period_tokens: &[u32],
    budget: usize,
    depth_percent: f64,
) -> Vec<u32> {
    let keep = budget.saturating_sub(needle.len()).min(haystack.len());
    let context = &haystack[..keep];

    let mut insertion = if depth_percent >= 100.0 {
        keep
    } else {
        ((keep as f64 * depth_percent / 100.0) as usize).min(keep)
    };
    if insertion < keep {
        while insertion > 0 && !period_tokens.contains(&context[insertion - 1]) {
            insertion -= 1;
        }
    }

    let mut tokens = Vec::with_capacity(keep + needle.len());
    tokens.extend_from_slice(&context[..insertion]);
    tokens.extend_from_slice(needle);
    tokens.extend_from_slice(&context[insertion..]);
    tokens
}

/// Fill the `{context}` and `{question}` placeholders
pub fn render_prompt(template: &str, context: &str, question: &str) -> String {
    template
        .replace("{question}", question)
        .replace("{context}", context)
}

/// One benchmark prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    pub context_length: usize,
    pub depth_percent: f64,
    /// Haystack plus needle tokens actually used
    pub context_tokens: usize,
    pub prompt: String,
}

/// Output of the prompt stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSet {
    pub task: String,
    pub needle: String,
    pub question: String,
    pub prompts: Vec<PromptRecord>,
}

/// Prompt stage: build every grid cell's prompt and write `prompts.json`
pub fn run_prompts<T: ContextTokenizer>(config: &NiahConfig, tokenizer: &T) -> Result<PromptSet> {
    let p = &config.prompt;
    let lengths = config.context_lengths();
    let depths = config.depth_percents();
    let max_len = lengths.last().copied().unwrap_or(0);

    let text = load_haystack(&p.haystack_dir)?;
    let mut haystack = tokenizer.encode(&text)?;
    if haystack.is_empty() {
        bail!("haystack encodes to no tokens");
    }
    // Repeat the corpus until the longest context fits
    let single = haystack.clone();
    while haystack.len() < max_len {
        haystack.extend_from_slice(&single);
    }

    let needle = tokenizer.encode(&p.needle)?;
    let period_tokens = tokenizer.encode(".")?;

    let mut prompts = Vec::with_capacity(lengths.len() * depths.len());
    for &length in &lengths {
        let budget = length.saturating_sub(p.final_context_buffer);
        if budget <= needle.len() {
            warn!("context length {length} leaves no room for the haystack");
        }
        for &depth in &depths {
            let tokens = insert_needle(&haystack, &needle, &period_tokens, budget, depth);
            let context = tokenizer.decode(&tokens)?;
            prompts.push(PromptRecord {
                context_length: length,
                depth_percent: depth,
                context_tokens: tokens.len(),
                prompt: render_prompt(&p.template, &context, &p.retrieval_question),
            });
        }
    }

    let set = PromptSet {
        task: config.task.clone(),
        needle: p.needle.clone(),
        question: p.retrieval_question.clone(),
        prompts,
    };
    write_json(&config.prompts_path(), &set)?;
    info!(
        "Wrote {} prompts ({} lengths x {} depths) to {}",
        set.prompts.len(),
        lengths.len(),
        depths.len(),
        config.prompts_path().display()
    );
    Ok(set)
}

/// One model answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub context_length: usize,
    pub depth_percent: f64,
    pub response: String,
    pub generated_tokens: usize,
}

/// Output of one pred run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPredictions {
    pub run: String,
    /// Heads kept per token, `None` for full attention
    pub k: Option<i64>,
    pub metric: HeadMetric,
    pub predictions: Vec<PredictionRecord>,
}

/// Pred stage: answer every prompt of `prompts.json` once per run
pub fn run_predictions(config: &NiahConfig, model: &mut ShipModel) -> Result<Vec<RunPredictions>> {
    let set: PromptSet = read_json(&config.prompts_path())?;
    let pred = &config.pred;
    let mut all = Vec::new();

    for run in config.runs() {
        match run.k {
            Some(k) => model.enable_head_sparsification(k, pred.metric, pred.allow_during_prefill)?,
            None => model.disable_head_sparsification(),
        }
        for &layer in &pred.record_layers {
            model.attach_recorder(layer, RecordSite::AttnWeights, pred.record_policy)?;
        }
        info!("Run {}: {} prompts", run.name, set.prompts.len());

        let mut predictions = Vec::with_capacity(set.prompts.len());
        for (idx, record) in set.prompts.iter().enumerate() {
            let prompt = if pred.use_chat_template {
                model.apply_chat_template(&record.prompt, None)
            } else {
                record.prompt.clone()
            };
            let stop_tokens = model.stop_token_ids();
            let result = model
                .generate_with_details(&prompt, pred.max_new_tokens, pred.temperature, &stop_tokens)
                .with_context(|| {
                    format!(
                        "run {} failed at length {} depth {}",
                        run.name, record.context_length, record.depth_percent
                    )
                })?;

            if !pred.record_layers.is_empty() {
                for phase in [Phase::Prefill, Phase::Decode] {
                    model.save_recordings(phase, config.recording_path(&run.name, idx, phase))?;
                }
            }

            info!(
                "[{}] len={} depth={:.0}%: {}",
                run.name,
                record.context_length,
                record.depth_percent,
                result.generated_text.trim()
            );
            predictions.push(PredictionRecord {
                context_length: record.context_length,
                depth_percent: record.depth_percent,
                generated_tokens: result.generated_tokens.len(),
                response: result.generated_text,
            });
        }

        for &layer in &pred.record_layers {
            model.detach_recorder(layer, RecordSite::AttnWeights);
        }

        let out = RunPredictions {
            run: run.name.clone(),
            k: run.k,
            metric: pred.metric,
            predictions,
        };
        write_json(&config.pred_path(&run.name), &out)?;
        all.push(out);
    }

    model.disable_head_sparsification();
    Ok(all)
}

/// Fraction of `keywords` found in `response`, case-insensitive
pub fn score_response(response: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let response = response.to_lowercase();
    let hits = keywords
        .iter()
        .filter(|k| response.contains(&k.to_lowercase()))
        .count();
    hits as f64 / keywords.len() as f64
}

/// Score of one grid cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellScore {
    pub context_length: usize,
    pub depth_percent: f64,
    pub score: f64,
}

/// Scores of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunScores {
    pub k: Option<i64>,
    pub mean: f64,
    pub scores: Vec<CellScore>,
}

/// `results.json`: task → run → scores
pub type NiahResults = BTreeMap<String, BTreeMap<String, RunScores>>;

/// Eval stage: score every run and merge into `results.json`
pub fn run_eval(config: &NiahConfig) -> Result<NiahResults> {
    let keywords = &config.eval.answer_keywords;
    let mut task_results = BTreeMap::new();

    for run in config.runs() {
        let preds: RunPredictions = read_json(&config.pred_path(&run.name))?;
        let scores: Vec<CellScore> = preds
            .predictions
            .iter()
            .map(|p| CellScore {
                context_length: p.context_length,
                depth_percent: p.depth_percent,
                score: score_response(&p.response, keywords),
            })
            .collect();
        let mean = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(|s| s.score).sum::<f64>() / scores.len() as f64
        };
        info!("{} / {}: mean score {:.3}", config.task, run.name, mean);
        task_results.insert(
            run.name,
            RunScores {
                k: preds.k,
                mean,
                scores,
            },
        );
    }

    let path = config.results_path();
    let mut results: NiahResults = if path.exists() {
        read_json(&path)?
    } else {
        NiahResults::new()
    };
    results.insert(config.task.clone(), task_results);
    write_json(&path, &results)?;
    Ok(results)
}

/// Text grid of scores: one row per depth, one column per context length
pub fn render_heatmap(title: &str, scores: &RunScores) -> Result<String> {
    let mut out = String::new();
    write_heatmap(&mut out, title, scores)?;
    Ok(out)
}

fn write_heatmap(out: &mut impl fmt::Write, title: &str, scores: &RunScores) -> fmt::Result {
    let mut lengths: Vec<usize> = scores.scores.iter().map(|s| s.context_length).collect();
    lengths.sort_unstable();
    lengths.dedup();
    let mut depths: Vec<f64> = scores.scores.iter().map(|s| s.depth_percent).collect();
    depths.sort_by(f64::total_cmp);
    depths.dedup();

    writeln!(out, "{title} (mean {:.3})", scores.mean)?;
    write!(out, "{:>8}", "depth%")?;
    for len in &lengths {
        write!(out, " {len:>7}")?;
    }
    writeln!(out)?;

    for depth in &depths {
        write!(out, "{depth:>8.1}")?;
        for len in &lengths {
            let cell = scores
                .scores
                .iter()
                .find(|s| s.context_length == *len && s.depth_percent == *depth);
            match cell {
                Some(s) => write!(out, " {:>7.2}", s.score)?,
                None => write!(out, " {:>7}", "-")?,
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Vis stage: write `heatmap_{run}.txt` for every run of the task
///
/// Returns `(run, heatmap)` pairs.
pub fn run_vis(config: &NiahConfig) -> Result<Vec<(String, String)>> {
    let results: NiahResults = read_json(&config.results_path())?;
    let Some(task_results) = results.get(&config.task) else {
        bail!("no results for task '{}' in results.json", config.task);
    };

    let mut maps = Vec::new();
    for (run, scores) in task_results {
        let map = render_heatmap(&format!("{} / {run}", config.task), scores)?;
        let path = config.heatmap_path(run);
        fs::write(&path, &map).with_context(|| format!("Failed to write {}", path.display()))?;
        maps.push((run.clone(), map));
    }
    Ok(maps)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One token per char
    struct CharTokenizer;

    impl ContextTokenizer for CharTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.chars().map(u32::from).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().filter_map(|&c| char::from_u32(c)).collect())
        }
    }

    fn chars(s: &str) -> Vec<u32> {
        CharTokenizer.encode(s).unwrap()
    }

    fn text(ids: &[u32]) -> String {
        CharTokenizer.decode(ids).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config: NiahConfig = serde_json::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.task, "niah");
        assert_eq!(config.pred.k_values, vec![3]);
        assert_eq!(
            config
                .runs()
                .iter()
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>(),
            vec!["k3", "full"]
        );
    }

    #[test]
    fn test_config_partial_override() {
        let config: NiahConfig = serde_json::from_str(
            r#"{"task": "short", "pred": {"k_values": [1, 2], "metric": "entropy",
                "include_full": false}}"#,
        )
        .unwrap();
        assert_eq!(config.pred.metric, HeadMetric::Entropy);
        assert_eq!(config.pred.max_new_tokens, 50);
        assert_eq!(config.runs().len(), 2);
        assert_eq!(config.pred_path("k1"), PathBuf::from("outputs/niah/pred_k1.json"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = NiahConfig::default();
        config.pred.k_values = vec![-1];
        assert!(config.validate().is_err());

        let mut config = NiahConfig::default();
        config.prompt.context_lengths_min = 9000;
        assert!(config.validate().is_err());

        let mut config = NiahConfig::default();
        config.prompt.template = "no placeholder".to_string();
        assert!(config.validate().is_err());

        let mut config = NiahConfig::default();
        config.pred.k_values.clear();
        config.pred.include_full = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_linear_grid() {
        assert_eq!(linear_grid(0.0, 100.0, 5), vec![0.0, 25.0, 50.0, 75.0, 100.0]);
        assert_eq!(linear_grid(7.0, 9.0, 1), vec![7.0]);
        assert!(linear_grid(0.0, 1.0, 0).is_empty());

        let config = NiahConfig::default();
        assert_eq!(
            config.context_lengths(),
            vec![1000, 2000, 3000, 4000, 5000, 6000, 7000, 8000]
        );
    }

    #[test]
    fn test_needle_moves_to_sentence_start() {
        let haystack = chars("Aaa. Bbb. Ccc. Ddd.");
        let needle = chars("[N]");
        let period = chars(".");

        // 50% of 19 chars lands on the space after "Bbb."
        let out = insert_needle(&haystack, &needle, &period, 100, 50.0);
        assert_eq!(text(&out), "Aaa. Bbb.[N] Ccc. Ddd.");

        let start = insert_needle(&haystack, &needle, &period, 100, 0.0);
        assert_eq!(text(&start), "[N]Aaa. Bbb. Ccc. Ddd.");

        let end = insert_needle(&haystack, &needle, &period, 100, 100.0);
        assert_eq!(text(&end), "Aaa. Bbb. Ccc. Ddd.[N]");
    }

    #[test]
    fn test_needle_budget_truncates_haystack() {
        let haystack = chars("Aaa. Bbb. Ccc. Ddd.");
        let needle = chars("[N]");
        let out = insert_needle(&haystack, &needle, &chars("."), 12, 100.0);
        assert_eq!(out.len(), 12);
        assert_eq!(text(&out), "Aaa. Bbb.[N]");

        // Budget smaller than the needle keeps only the needle
        let tiny = insert_needle(&haystack, &needle, &chars("."), 2, 50.0);
        assert_eq!(text(&tiny), "[N]");
    }

    #[test]
    fn test_render_prompt() {
        let prompt = render_prompt("<{context}> Q: {question}", "hay", "where?");
        assert_eq!(prompt, "<hay> Q: where?");
    }

    #[test]
    fn test_score_response() {
        let keywords = vec!["sandwich".to_string(), "Dolores Park".to_string()];
        assert_eq!(score_response("Eat a SANDWICH in dolores park.", &keywords), 1.0);
        assert_eq!(score_response("A sandwich.", &keywords), 0.5);
        assert_eq!(score_response("No idea.", &keywords), 0.0);
        assert_eq!(score_response("anything", &[]), 0.0);
    }

    #[test]
    fn test_prompt_stage() {
        let dir = tempfile::tempdir().unwrap();
        let hay = dir.path().join("hay");
        fs::create_dir_all(&hay).unwrap();
        fs::write(hay.join("b.txt"), "Second file. ").unwrap();
        fs::write(hay.join("a.txt"), "First file. ").unwrap();
        fs::write(hay.join("skip.md"), "ignored").unwrap();

        let config: NiahConfig = serde_json::from_value(serde_json::json!({
            "output_dir": dir.path().join("out"),
            "prompt": {
                "haystack_dir": hay,
                "needle": "NEEDLE.",
                "retrieval_question": "Q?",
                "template": "{context}|{question}",
                "context_lengths_min": 40,
                "context_lengths_max": 80,
                "context_lengths_num_intervals": 2,
                "document_depth_percent_intervals": 3,
                "final_context_buffer": 10
            }
        }))
        .unwrap();

        let set = run_prompts(&config, &CharTokenizer).unwrap();
        assert_eq!(set.prompts.len(), 6);
        assert!(config.prompts_path().exists());

        let first = &set.prompts[0];
        assert_eq!(first.context_length, 40);
        assert_eq!(first.context_tokens, 30);
        assert!(first.prompt.starts_with("NEEDLE.First file."));
        assert!(first.prompt.ends_with("|Q?"));

        let last = set.prompts.last().unwrap();
        assert_eq!(last.context_length, 80);
        assert_eq!(last.depth_percent, 100.0);
        assert!(last.prompt.ends_with("NEEDLE.|Q?"));
    }

    #[test]
    fn test_hf_tokenizer_as_context_tokenizer() {
        use std::str::FromStr;

        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "[UNK]": 0, ".": 1, "hay": 2, "needle": 3 },
                "unk_token": "[UNK]"
            }
        });
        let tokenizer = Tokenizer::from_str(&json.to_string()).unwrap();

        let ids = ContextTokenizer::encode(&tokenizer, "hay hay. needle").unwrap();
        assert_eq!(ids, vec![2, 2, 1, 3]);
        assert_eq!(ContextTokenizer::encode(&tokenizer, ".").unwrap(), vec![1]);
        assert_eq!(
            ContextTokenizer::decode(&tokenizer, &[3, 1]).unwrap(),
            "needle ."
        );
    }

    #[test]
    fn test_missing_haystack() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_haystack(dir.path()).is_err());
    }

    #[test]
    fn test_eval_and_vis_stages() {
        let dir = tempfile::tempdir().unwrap();
        let config = NiahConfig {
            output_dir: dir.path().to_path_buf(),
            ..NiahConfig::default()
        };

        for (run, k, answers) in [
            ("k3", Some(3), ["sandwich", "nothing"]),
            ("full", None, ["sandwich in dolores park", "dolores park"]),
        ] {
            let preds = RunPredictions {
                run: run.to_string(),
                k,
                metric: HeadMetric::L2,
                predictions: answers
                    .iter()
                    .enumerate()
                    .map(|(i, a)| PredictionRecord {
                        context_length: 1000,
                        depth_percent: i as f64 * 100.0,
                        response: (*a).to_string(),
                        generated_tokens: 3,
                    })
                    .collect(),
            };
            write_json(&config.pred_path(run), &preds).unwrap();
        }

        let results = run_eval(&config).unwrap();
        let task = &results["niah"];
        assert_eq!(task["k3"].mean, 0.25);
        assert_eq!(task["full"].mean, 0.75);
        assert_eq!(task["k3"].k, Some(3));

        let maps = run_vis(&config).unwrap();
        assert_eq!(maps.len(), 2);
        assert!(config.heatmap_path("full").exists());
        let full = &maps.iter().find(|(run, _)| run == "full").unwrap().1;
        assert!(full.contains("mean 0.750"));
        assert!(full.contains("1.00"));
        assert!(full.contains("0.50"));
    }

    #[test]
    fn test_eval_merges_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NiahConfig {
            output_dir: dir.path().to_path_buf(),
            ..NiahConfig::default()
        };
        config.pred.include_full = false;

        for task in ["a", "b"] {
            config.task = task.to_string();
            let preds = RunPredictions {
                run: "k3".to_string(),
                k: Some(3),
                metric: HeadMetric::L2,
                predictions: Vec::new(),
            };
            write_json(&config.pred_path("k3"), &preds).unwrap();
            run_eval(&config).unwrap();
        }

        let results: NiahResults = read_json(&config.results_path()).unwrap();
        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(results["a"]["k3"].mean, 0.0);
    }

    #[test]
    fn test_heatmap_marks_missing_cells() {
        let scores = RunScores {
            k: None,
            mean: 1.0,
            scores: vec![
                CellScore {
                    context_length: 10,
                    depth_percent: 0.0,
                    score: 1.0,
                },
                CellScore {
                    context_length: 20,
                    depth_percent: 50.0,
                    score: 1.0,
                },
            ],
        };
        let map = render_heatmap("t", &scores).unwrap();
        let lines: Vec<&str> = map.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "t (mean 1.000)");
        assert_eq!(lines[1], "  depth%      10      20");
        assert_eq!(lines[2], "     0.0    1.00       -");
        assert_eq!(lines[3], "    50.0       -    1.00");
    }
}
