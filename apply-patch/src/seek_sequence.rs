/// Finds `pattern` as a contiguous run inside `lines`, starting the search at
/// `start`. Matching gets progressively more lenient: exact, then ignoring
/// trailing whitespace, then ignoring surrounding whitespace, then also
/// folding typographic punctuation to ASCII. When `eof` is set the pattern is
/// first tried against the end of the file.
pub(crate) fn seek_sequence(
    lines: &[String],
    pattern: &[String],
    start: usize,
    eof: bool,
) -> Option<usize> {
    if pattern.is_empty() {
        return Some(start);
    }
    if pattern.len() > lines.len() {
        return None;
    }

    let last_start = lines.len() - pattern.len();
    let search_start = if eof { last_start } else { start };
    if search_start > last_start {
        return None;
    }

    let comparators: [fn(&str, &str) -> bool; 4] = [
        |a, b| a == b,
        |a, b| a.trim_end() == b.trim_end(),
        |a, b| a.trim() == b.trim(),
        |a, b| normalise(a) == normalise(b),
    ];
    for same in comparators {
        for i in search_start..=last_start {
            if pattern
                .iter()
                .zip(&lines[i..i + pattern.len()])
                .all(|(p, l)| same(l, p))
            {
                return Some(i);
            }
        }
    }

    if eof && start < search_start {
        return seek_sequence(lines, pattern, start, false);
    }
    None
}

fn normalise(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| match c {
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => '-',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            '\u{00A0}' | '\u{2002}' | '\u{2003}' | '\u{2009}' | '\u{202F}' | '\u{3000}' => ' ',
            other => other,
        })
        .collect()
}
