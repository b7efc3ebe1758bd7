use super::types::{ComplexityLevel, TaskClassification, TaskType};
use regex::Regex;
use tracing::warn;

const TYPE_PATTERNS: &[(TaskType, &str)] = &[
    (
        TaskType::Research,
        r"\b(research\w*|investigat\w*|find|search\w*|look up|gather\w*|compar\w*|survey\w*|sources?|literature|explore)\b",
    ),
    (
        TaskType::Analysis,
        r"\b(analy[sz]\w*|evaluat\w*|assess\w*|summari[sz]\w*|review\w*|metrics?|statistics?|insights?|trends?)\b",
    ),
    (
        TaskType::Development,
        r"\b(implement\w*|build\w*|code|coding|develop\w*|refactor\w*|fix\w*|debug\w*|program\w*|compil\w*|deploy\w*|tests?)\b",
    ),
    (
        TaskType::Automation,
        r"\b(automat\w*|schedul\w*|scripts?|workflows?|pipelines?|batch|cron|recurring|every (day|hour|week))\b",
    ),
];

const SOURCE_PATTERNS: &[&str] = &[
    r"\b(web|internet|online|websites?)\b",
    r"\b(papers?|articles?|journals?|academic|publications?)\b",
    r"\b(docs|documentation|manuals?)\b",
    r"\b(files?|local|repository|repo|codebase)\b",
    r"\b(news|blogs?|forums?)\b",
    r"\b(databases?|datasets?|apis?)\b",
];

const HIGH_QUALIFIERS: &str =
    r"\b(comprehensive|complex|detailed|in-depth|thorough|end-to-end|multi-step|extensive|large-scale)\b";
const LOW_QUALIFIERS: &str = r"\b(simple|quick|quickly|brief|basic|small|trivial)\b";

/// Keyword heuristics for task type, complexity and source count
#[derive(Debug, Clone)]
pub struct TaskClassifier {
    types: Vec<(TaskType, Regex)>,
    sources: Vec<Regex>,
    high: Option<Regex>,
    low: Option<Regex>,
}

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("(?i){}", pattern))
        .map_err(|e| warn!("Skipping invalid classifier pattern: {}", e))
        .ok()
}

impl Default for TaskClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskClassifier {
    pub fn new() -> Self {
        Self {
            types: TYPE_PATTERNS
                .iter()
                .filter_map(|(task_type, pattern)| Some((*task_type, compile(pattern)?)))
                .collect(),
            sources: SOURCE_PATTERNS.iter().filter_map(|p| compile(p)).collect(),
            high: compile(HIGH_QUALIFIERS),
            low: compile(LOW_QUALIFIERS),
        }
    }

    pub fn classify(&self, description: &str) -> TaskClassification {
        let mut matched_keywords = Vec::new();
        let mut best: Option<(TaskType, usize)> = None;
        for (task_type, regex) in &self.types {
            let hits: Vec<String> = regex
                .find_iter(description)
                .map(|m| m.as_str().to_lowercase())
                .collect();
            // earlier families win ties
            if !hits.is_empty() && best.is_none_or(|(_, count)| hits.len() > count) {
                best = Some((*task_type, hits.len()));
            }
            matched_keywords.extend(hits);
        }
        matched_keywords.sort();
        matched_keywords.dedup();

        let independent_sources = self
            .sources
            .iter()
            .filter(|regex| regex.is_match(description))
            .count();

        TaskClassification {
            task_type: best.map_or(TaskType::General, |(task_type, _)| task_type),
            complexity: self.complexity(description),
            independent_sources,
            matched_keywords,
        }
    }

    /// Length in words sets the base level; qualifiers move it one step
    fn complexity(&self, description: &str) -> ComplexityLevel {
        let words = description.split_whitespace().count();
        let mut score: i32 = match words {
            0..=12 => 0,
            13..=40 => 1,
            _ => 2,
        };
        if self.high.as_ref().is_some_and(|r| r.is_match(description)) {
            score += 1;
        }
        if self.low.as_ref().is_some_and(|r| r.is_match(description)) {
            score -= 1;
        }
        match score {
            i32::MIN..=0 => ComplexityLevel::Low,
            1 => ComplexityLevel::Medium,
            _ => ComplexityLevel::High,
        }
    }
}
