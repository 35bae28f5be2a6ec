//! Day transcript summarization.
//!
//! A deterministic concatenative summary is always available; a model-backed
//! summarizer can be installed behind the `DaySummarizer` seam and is used
//! when `daily_summary_use_model` is enabled. Oversize transcripts are split
//! recursively, each segment summarized, then the segment summaries
//! summarized again.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::types::DayEvent;

pub const SUMMARY_MAX_INPUT_TOKENS: usize = 4000;
pub const SUMMARY_MAX_RECURSION_DEPTH: usize = 6;

/// Model seam for narrative day summaries (the `low` alias in the original
/// model router). Installed by the embedding application.
#[async_trait]
pub trait DaySummarizer: Send + Sync {
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn event_line(event: &DayEvent) -> String {
    format!("- [{}] {}", event.kind, event.text)
}

/// Idle chatter and tool telemetry are excluded from summaries unless they
/// carry an explicit failure marker.
fn is_low_signal(event: &DayEvent) -> bool {
    let kind = event.kind.as_str();
    let text = event.text.to_lowercase();

    if matches!(kind, "user" | "main_agent" | "task_agent_event") {
        return false;
    }
    if matches!(kind, "system" | "tool_event") {
        return !text.contains("error=") && !text.contains("ok=false") && !text.contains("failed");
    }
    if kind == "worker_event" {
        return !["failed", "error", "blocked", "completed", "done"]
            .iter()
            .any(|token| text.contains(token));
    }
    if text.len() < 24 {
        return true;
    }
    const ACK_MARKERS: [&str; 8] = [
        "thanks",
        "thank you",
        "okay",
        "cool",
        "nice",
        "sounds good",
        "got it",
        "ok",
    ];
    ACK_MARKERS.iter().any(|marker| text.contains(marker))
}

fn summary_prompt(lines: &str) -> String {
    format!(
        "Summarize this raw daily transcript into compact daily memory bullets.\n\
         Transcript format:\n\
         - [user] text from human\n\
         - [main_agent] assistant reply\n\
         - [task_agent_event] central scheduler/task lifecycle event\n\
         - [tool_event] significant tool or integration event\n\
         - [system] orchestration/runtime status event\n\n\
         Requirements:\n\
         - Focus on meaningful work only: what was done, how, and the outcome.\n\
         - Do not include idle chat, acknowledgments, or repetitive exchanges.\n\
         - Include decisions, design choices, and concrete progress state.\n\
         - Include next step only if explicit.\n\
         - Keep it concise and factual.\n\n\
         Transcript:\n{lines}"
    )
}

/// Deterministic fallback: kind counts plus the last few signal entries.
fn concatenative_summary(events: &[DayEvent]) -> String {
    let signal: Vec<&DayEvent> = events.iter().filter(|e| !is_low_signal(e)).collect();
    let effective: Vec<&DayEvent> = if signal.is_empty() {
        events.iter().collect()
    } else {
        signal
    };

    let mut kind_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for event in &effective {
        *kind_counts.entry(event.kind.as_str()).or_insert(0) += 1;
    }
    let kinds = kind_counts
        .iter()
        .map(|(kind, count)| format!("{kind} x{count}"))
        .collect::<Vec<_>>()
        .join(", ");
    let highlights = effective
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(|event| {
            let text: String = event.text.chars().take(90).collect();
            format!("{}='{}'", event.kind, text)
        })
        .collect::<Vec<_>>()
        .join("; ");

    format!(
        "- Signal entries: {} of {}\n- Kinds: {kinds}\n- Highlights: {highlights}",
        effective.len(),
        events.len()
    )
}

async fn summarize_batch(events: &[DayEvent], model: Option<&dyn DaySummarizer>) -> String {
    if let Some(model) = model {
        let signal: Vec<&DayEvent> = events.iter().filter(|e| !is_low_signal(e)).collect();
        let effective: Vec<&DayEvent> = if signal.is_empty() {
            events.iter().collect()
        } else {
            signal
        };
        let lines: String = effective
            .iter()
            .map(|e| event_line(e))
            .collect::<Vec<_>>()
            .join("\n")
            .chars()
            .take(12_000)
            .collect();
        match model.summarize(&summary_prompt(&lines)).await {
            Ok(text) if !text.trim().is_empty() => {
                return text.split_whitespace().collect::<Vec<_>>().join(" ");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Model summarizer failed; falling back");
            }
        }
    }
    concatenative_summary(events)
}

/// Summarize a full day's raw events, recursively splitting oversize input
/// when a model is doing the work.
pub async fn summarize_events(events: &[DayEvent], model: Option<&dyn DaySummarizer>) -> String {
    summarize_events_inner(events, model, 0).await
}

async fn summarize_events_inner(
    events: &[DayEvent],
    model: Option<&dyn DaySummarizer>,
    depth: usize,
) -> String {
    if events.is_empty() {
        return "- No daily transcript entries to summarize.".to_string();
    }
    if model.is_none() || depth >= SUMMARY_MAX_RECURSION_DEPTH {
        return summarize_batch(events, model).await;
    }

    let text: String = events.iter().map(event_line).collect::<Vec<_>>().join("\n");
    if estimate_tokens(&text) <= SUMMARY_MAX_INPUT_TOKENS || events.len() <= 4 {
        return summarize_batch(events, model).await;
    }

    let mid = (events.len() / 2).max(1);
    let left = Box::pin(summarize_events_inner(&events[..mid], model, depth + 1)).await;
    let right = Box::pin(summarize_events_inner(&events[mid..], model, depth + 1)).await;
    let merged = vec![
        segment_event(format!("segment_left: {left}")),
        segment_event(format!("segment_right: {right}")),
    ];
    summarize_batch(&merged, model).await
}

fn segment_event(text: String) -> DayEvent {
    DayEvent {
        event_id: 0,
        day: String::new(),
        event_time: String::new(),
        session_id: "segment_summary".to_string(),
        kind: "task_agent_event".to_string(),
        text,
        layer: crate::types::MemoryLayer::Summary,
    }
}
