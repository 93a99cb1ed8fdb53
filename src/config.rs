use serde::{Deserialize, Serialize};

/// Engine-wide settings. Every field has a default, so hosts can load a
/// partial JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    /// Model requests in the pre-tool correction loop.
    pub max_correction_attempts: u32,
    /// Repeat increments allowed in the agentic loop.
    pub max_tool_repeats: u32,
    /// Successful executions of one identical call before the loop guard trips.
    pub max_identical_calls: u32,
    pub max_iterations: u32,
    /// Tool results longer than this many characters go to the output buffer.
    pub tool_output_inline_limit: usize,
    pub enable_tool_output_reader: bool,
    pub compaction: CompactionConfig,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_output_tokens: 4096,
            temperature: None,
            system_prompt: None,
            max_correction_attempts: 3,
            max_tool_repeats: 5,
            max_identical_calls: 3,
            max_iterations: 50,
            tool_output_inline_limit: 4000,
            enable_tool_output_reader: true,
            compaction: CompactionConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_correction_attempts(mut self, attempts: u32) -> Self {
        self.max_correction_attempts = attempts;
        self
    }

    pub fn with_max_tool_repeats(mut self, repeats: u32) -> Self {
        self.max_tool_repeats = repeats;
        self
    }

    pub fn with_max_identical_calls(mut self, calls: u32) -> Self {
        self.max_identical_calls = calls;
        self
    }

    pub fn with_max_iterations(mut self, iterations: u32) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_tool_output_inline_limit(mut self, chars: usize) -> Self {
        self.tool_output_inline_limit = chars;
        self
    }

    pub fn with_tool_output_reader(mut self, enabled: bool) -> Self {
        self.enable_tool_output_reader = enabled;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// When and how much history gets folded into the rolling summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub max_tokens: u32,
    pub threshold_ratio: f32,
    /// Subtracted from the threshold to leave room for tool schemas and the reply.
    pub reserved_overhead_tokens: u32,
    /// Messages folded into the summary per compaction.
    pub chunk_size: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_tokens: 32_000,
            threshold_ratio: 0.67,
            reserved_overhead_tokens: 1000,
            chunk_size: 5,
        }
    }
}

impl CompactionConfig {
    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_threshold_ratio(mut self, ratio: f32) -> Self {
        self.threshold_ratio = ratio;
        self
    }

    pub fn with_reserved_overhead(mut self, tokens: u32) -> Self {
        self.reserved_overhead_tokens = tokens;
        self
    }

    pub fn with_chunk_size(mut self, messages: usize) -> Self {
        self.chunk_size = messages;
        self
    }

    /// Token estimate above which compaction runs.
    pub fn threshold(&self) -> u32 {
        let scaled = (self.max_tokens as f64 * self.threshold_ratio as f64).floor() as u32;
        scaled.saturating_sub(self.reserved_overhead_tokens)
    }
}

/// Backoff for transient transport errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay_ms: 500,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: true,
        }
    }
}
