//! Line-windowed chunking: slides a fixed-size window of lines over a
//! file's content with overlap between consecutive windows. Replaces the
//! donor's tree-sitter AST chunker (dropped along with all per-language
//! grammars) with something far simpler and language-agnostic; it trades
//! syntactic precision for being able to chunk any text file at all.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
}

/// Splits `text` into overlapping windows of `chunk_size` lines, advancing
/// by `chunk_size - chunk_overlap` lines each step. A single line longer
/// than the file's overall content is never split further — the window
/// boundary is always on a line break.
pub fn chunk_lines(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let chunk_size = chunk_size.max(1);
    let overlap = chunk_overlap.min(chunk_size.saturating_sub(1));
    let step = chunk_size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + chunk_size).min(lines.len());
        let content = lines[start..end].join("\n");
        chunks.push(Chunk {
            start_line: (start + 1) as u32,
            end_line: end as u32,
            content,
        });
        if end >= lines.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_lines("", 10, 2).is_empty());
    }

    #[test]
    fn short_file_yields_one_chunk() {
        let text = "a\nb\nc\n";
        let chunks = chunk_lines(text, 10, 2);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }

    #[test]
    fn long_file_overlaps_consecutive_windows() {
        let text: String = (1..=100).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let chunks = chunk_lines(&text, 10, 3);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 10);
        assert_eq!(chunks[1].start_line, 8); // step = 10 - 3 = 7, start = 7 -> line 8
        let last = chunks.last().unwrap();
        assert_eq!(last.end_line, 100);
    }

    #[test]
    fn overlap_never_exceeds_chunk_size() {
        let text = "a\nb\nc\n";
        // overlap >= chunk_size would infinite-loop without clamping
        let chunks = chunk_lines(text, 2, 5);
        assert!(!chunks.is_empty());
    }
}
