use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferry_core::{CleanupPrompt, FileSlot, PartialFileCandidate, SlotState, Snapshot};
use indicatif::{
    HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle,
};

const GLOBAL_TEMPLATE: &str = "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";
const SLOT_TEMPLATE: &str = "  {prefix:30!} [{bar:25}] {bytes}/{total_bytes} {msg}";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Terminal view of a job: one bar for the totals, one per occupied slot.
pub struct ProgressView {
    multi: MultiProgress,
    global: ProgressBar,
    slots: Vec<Option<ProgressBar>>,
    paused: Arc<AtomicBool>,
}

impl ProgressView {
    pub fn new(label: &str) -> Self {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stdout());
        let global = multi.add(ProgressBar::new(0));
        global.set_style(style(GLOBAL_TEMPLATE));
        global.set_prefix(label.to_string());
        Self {
            multi,
            global,
            slots: Vec::new(),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Prompt that suspends this view while it waits for an answer.
    pub fn prompt(&self) -> StdinPrompt {
        StdinPrompt {
            multi: self.multi.clone(),
            paused: Arc::clone(&self.paused),
        }
    }

    pub fn render(&mut self, snapshot: &Snapshot) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }

        let global = &snapshot.global;
        self.global
            .set_length(global.bytes_total.unwrap_or(global.bytes_transferred));
        self.global.set_position(global.bytes_transferred);
        self.global.set_message(global_message(snapshot));

        let mut seen = vec![false; self.slots.len()];
        for slot in &snapshot.slots {
            if slot.slot_index >= self.slots.len() {
                self.slots.resize_with(slot.slot_index + 1, || None);
                seen.resize(slot.slot_index + 1, false);
            }
            seen[slot.slot_index] = true;
            let bar = self.slots[slot.slot_index].get_or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(style(SLOT_TEMPLATE));
                bar
            });
            render_slot(bar, slot);
        }

        for (index, bar) in self.slots.iter_mut().enumerate() {
            if !seen[index] {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
            }
        }
    }

    pub fn finish(mut self) {
        for bar in self.slots.drain(..).flatten() {
            bar.finish_and_clear();
        }
        self.global.finish();
    }
}

fn render_slot(bar: &ProgressBar, slot: &FileSlot) {
    bar.set_prefix(slot.file_name.clone());
    bar.set_length(slot.bytes_total.unwrap_or(slot.bytes_done));
    bar.set_position(slot.bytes_done);
    let message = match slot.state {
        SlotState::Completing => "done".to_string(),
        SlotState::Active => rate_and_eta(slot.speed, slot.eta),
    };
    bar.set_message(message);
}

fn global_message(snapshot: &Snapshot) -> String {
    let global = &snapshot.global;
    let mut parts = Vec::new();
    if snapshot.items_total > 1 {
        parts.push(format!("item {}/{}", snapshot.item.max(1), snapshot.items_total));
    }
    match global.files_total {
        Some(total) => parts.push(format!("files {}/{}", global.files_completed, total)),
        None => parts.push(format!("files {}", global.files_completed)),
    }
    parts.push(rate_and_eta(global.speed, global.eta));
    if snapshot.queued > 0 {
        parts.push(format!("{} queued", snapshot.queued));
    }
    if global.errors > 0 {
        parts.push(format!("{} errors", global.errors));
    }
    parts.push(format!("elapsed {}", HumanDuration(global.elapsed)));
    parts.join(", ")
}

fn rate_and_eta(speed: u64, eta: Option<Duration>) -> String {
    match eta {
        Some(eta) => format!("{}/s, ETA {}", HumanBytes(speed), HumanDuration(eta)),
        None => format!("{}/s", HumanBytes(speed)),
    }
}

/// Asks on stdin whether partial files of a cancelled transfer should go.
pub struct StdinPrompt {
    multi: MultiProgress,
    paused: Arc<AtomicBool>,
}

impl CleanupPrompt for StdinPrompt {
    fn confirm(&self, candidates: &[PartialFileCandidate]) -> bool {
        self.paused.store(true, Ordering::Release);
        let answer = self.multi.suspend(|| {
            let stdin = io::stdin();
            ask(&mut stdin.lock(), &mut io::stdout(), candidates)
        });
        self.paused.store(false, Ordering::Release);
        match answer {
            Ok(answer) => answer,
            Err(err) => {
                log::warn!("cleanup prompt failed, keeping partial files: {err}");
                false
            }
        }
    }
}

fn ask<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    candidates: &[PartialFileCandidate],
) -> io::Result<bool> {
    writeln!(
        output,
        "The cancelled transfer left {} partial file(s):",
        candidates.len()
    )?;
    for candidate in candidates {
        writeln!(
            output,
            "  {} ({})",
            candidate.location,
            HumanBytes(candidate.size)
        )?;
    }
    write!(output, "Remove them? [y/N] ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{GlobalProgress, Location};
    use std::path::PathBuf;

    fn candidate(name: &str) -> PartialFileCandidate {
        PartialFileCandidate {
            location: Location::Local(PathBuf::from("/dest").join(name)),
            relative_path: PathBuf::from(name),
            size: 2048,
            modified: None,
            matched_pattern: ".Ab12Cd.partial".into(),
            original_name: "clip.mp4".into(),
        }
    }

    #[test]
    fn prompt_lists_candidates_and_reads_answer() {
        let candidates = vec![candidate("clip.mp4.Ab12Cd.partial")];
        let mut output = Vec::new();
        let answer = ask(&mut "yes\n".as_bytes(), &mut output, &candidates).unwrap();
        assert!(answer);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("/dest/clip.mp4.Ab12Cd.partial (2.00 KiB)"));
        assert!(text.ends_with("Remove them? [y/N] "));
    }

    #[test]
    fn prompt_defaults_to_no() {
        let candidates = vec![candidate("clip.mp4.Ab12Cd.partial")];
        let mut sink = Vec::new();
        assert!(!ask(&mut "\n".as_bytes(), &mut sink, &candidates).unwrap());
        assert!(!ask(&mut "".as_bytes(), &mut sink, &candidates).unwrap());
    }

    #[test]
    fn global_message_mentions_items_and_queue() {
        let snapshot = Snapshot {
            global: GlobalProgress {
                files_completed: 3,
                files_total: Some(10),
                speed: 1024,
                errors: 1,
                elapsed: Duration::from_secs(4),
                ..GlobalProgress::default()
            },
            queued: 2,
            item: 1,
            items_total: 2,
            ..Snapshot::default()
        };
        let message = global_message(&snapshot);
        assert!(message.starts_with("item 1/2, files 3/10, 1.00 KiB/s"));
        assert!(message.contains("2 queued"));
        assert!(message.contains("1 errors"));
    }
}
