//! Bounded projection of command output for the model context.
//!
//! The projection keeps the head and tail of the output and replaces the
//! middle with a single marker line. Anything already within the limits is
//! returned unchanged, and a projection always fits within the limits, so
//! projecting twice gives the same text as projecting once.

use serde::Serialize;

use crate::exec::ExecToolCallOutput;

pub(crate) const MODEL_FORMAT_MAX_BYTES: usize = 10 * 1024; // 10 KiB
pub(crate) const MODEL_FORMAT_MAX_LINES: usize = 256;

// One line is reserved for the elision marker.
const MODEL_FORMAT_HEAD_LINES: usize = (MODEL_FORMAT_MAX_LINES - 1) / 2;
const MODEL_FORMAT_TAIL_LINES: usize = MODEL_FORMAT_MAX_LINES - 1 - MODEL_FORMAT_HEAD_LINES;

const MARKER_RESERVE_BYTES: usize = 128;
const MODEL_FORMAT_HEAD_BYTES: usize = (MODEL_FORMAT_MAX_BYTES - MARKER_RESERVE_BYTES) / 2;
const MODEL_FORMAT_TAIL_BYTES: usize = MODEL_FORMAT_HEAD_BYTES;

pub fn truncate_for_model(s: &str) -> String {
    let lines: Vec<&str> = s.split_inclusive('\n').collect();
    let total_lines = lines.len();
    if s.len() <= MODEL_FORMAT_MAX_BYTES && total_lines <= MODEL_FORMAT_MAX_LINES {
        return s.to_string();
    }

    let head_take = MODEL_FORMAT_HEAD_LINES.min(total_lines);
    let tail_take = MODEL_FORMAT_TAIL_LINES.min(total_lines - head_take);

    let mut head = take_bytes_at_char_boundary(&lines[..head_take].concat(), MODEL_FORMAT_HEAD_BYTES);
    let tail_source = lines[total_lines - tail_take..].concat();
    let tail = take_last_bytes_at_char_boundary(&tail_source, MODEL_FORMAT_TAIL_BYTES);

    if !head.is_empty() && !head.ends_with('\n') {
        head.push('\n');
    }
    let kept = head.split_inclusive('\n').count() + tail.split_inclusive('\n').count();
    let omitted = total_lines.saturating_sub(kept);

    let mut out = String::with_capacity(MODEL_FORMAT_MAX_BYTES);
    out.push_str(&head);
    out.push_str(&format!(
        "[... omitted {omitted} of {total_lines} lines ...]\n"
    ));
    out.push_str(tail);
    out
}

fn take_bytes_at_char_boundary(s: &str, maxb: usize) -> String {
    if s.len() <= maxb {
        return s.to_string();
    }
    let mut end = maxb;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn take_last_bytes_at_char_boundary(s: &str, maxb: usize) -> &str {
    if s.len() <= maxb {
        return s;
    }
    let mut start = s.len() - maxb;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Text the model sees for a finished command: aggregated output, prefixed
/// with a notice on timeout, then projected.
pub fn format_exec_output_str(exec_output: &ExecToolCallOutput) -> String {
    let body = &exec_output.aggregated_output.text;
    if exec_output.timed_out {
        let notice = format!(
            "command timed out after {} milliseconds\n",
            exec_output.duration.as_millis()
        );
        return truncate_for_model(&format!("{notice}{body}"));
    }
    truncate_for_model(body)
}

#[derive(Serialize)]
struct ExecMetadata {
    exit_code: i32,
    duration_seconds: f32,
}

#[derive(Serialize)]
struct ExecOutput<'a> {
    output: &'a str,
    metadata: ExecMetadata,
}

/// JSON payload returned to the model as the shell tool's function output.
pub fn format_exec_output_for_model(exec_output: &ExecToolCallOutput) -> String {
    let formatted_output = format_exec_output_str(exec_output);

    // round to 1 decimal place
    let duration_seconds = ((exec_output.duration.as_secs_f32()) * 10.0).round() / 10.0;

    let payload = ExecOutput {
        output: &formatted_output,
        metadata: ExecMetadata {
            exit_code: exec_output.exit_code,
            duration_seconds,
        },
    };

    // Plain structs of strings and numbers always serialize.
    serde_json::to_string(&payload).unwrap_or_else(|_| formatted_output.clone())
}
