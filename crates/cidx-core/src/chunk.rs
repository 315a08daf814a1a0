//! Blank-line-boundary code chunker, used by the indexing pipeline to
//! turn a file's text into bounded-size pieces before embedding and FTS
//! upsert.
//!
//! A paragraph-boundary splitter adapted from prose paragraphs
//! (`\n\n`-separated) to source files, where blank lines play the same
//! structural role. Each chunk's ID is derived deterministically from
//! `(repo alias, file path, chunk index)` rather than drawn fresh, so
//! re-chunking an unchanged file always reproduces the same IDs and an
//! upsert overwrites in place instead of duplicating.

use uuid::Uuid;

const CHARS_PER_TOKEN: usize = 4;

/// Fixed across the process so the same `(alias, path, index)` always
/// derives the same chunk ID, on this run and the next.
const CHUNK_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6a, 0x1b, 0x1d, 0x9c, 0x3f, 0x52, 0x4b, 0x1e, 0x9a, 0x77, 0x0d, 0xe1, 0x2c, 0x88, 0x4f, 0x03,
]);

/// Deterministic chunk identity. Exposed separately from [`chunk_file`]
/// so a caller can recompute the ID range for a file without
/// re-chunking it (e.g. to tombstone a removed file's chunks).
pub fn chunk_id(repo_alias: &str, file_path: &str, chunk_index: u64) -> Uuid {
    Uuid::new_v5(
        &CHUNK_NAMESPACE,
        format!("{repo_alias}:{file_path}:{chunk_index}").as_bytes(),
    )
}

/// Upper bound on chunk indices ever assigned to a single file. A
/// removed or drastically-shrunk file may have stored more chunks than
/// its latest version would produce; deletion sweeps this whole range
/// so no tail chunk from an earlier, longer revision lingers as an
/// orphan.
pub const MAX_CHUNKS_PER_FILE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct CodeChunk {
    pub id: Uuid,
    pub chunk_index: u64,
    pub text: String,
}

/// Split `text` into chunks bounded by `max_tokens` (approximated at
/// [`CHARS_PER_TOKEN`] chars/token), splitting on blank-line boundaries
/// to keep each chunk a coherent run of lines. Returns chunks with
/// contiguous indices starting at 0; always returns at least one chunk,
/// even for empty input.
pub fn chunk_file(repo_alias: &str, file_path: &str, text: &str, max_tokens: usize) -> Vec<CodeChunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;

    if text.is_empty() {
        return vec![make_chunk(repo_alias, file_path, 0, text)];
    }

    let blocks: Vec<&str> = text.split("\n\n").collect();
    let mut chunks = Vec::new();
    let mut current_buf = String::new();
    let mut chunk_index: u64 = 0;

    for block in blocks {
        let trimmed = block.trim_end_matches('\n');
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            chunks.push(make_chunk(repo_alias, file_path, chunk_index, &current_buf));
            chunk_index += 1;
            current_buf.clear();
        }

        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                chunks.push(make_chunk(repo_alias, file_path, chunk_index, &current_buf));
                chunk_index += 1;
                current_buf.clear();
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = remaining.len().min(max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at].rfind('\n').map(|pos| pos + 1).unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = &remaining[..actual_split];
                chunks.push(make_chunk(repo_alias, file_path, chunk_index, piece.trim_end_matches('\n')));
                chunk_index += 1;
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        chunks.push(make_chunk(repo_alias, file_path, chunk_index, &current_buf));
    }

    if chunks.is_empty() {
        chunks.push(make_chunk(repo_alias, file_path, 0, text));
    }

    chunks
}

fn make_chunk(repo_alias: &str, file_path: &str, chunk_index: u64, text: &str) -> CodeChunk {
    CodeChunk {
        id: chunk_id(repo_alias, file_path, chunk_index),
        chunk_index,
        text: text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_file_is_a_single_chunk() {
        let chunks = chunk_file("repo-global", "src/a.rs", "fn main() {}", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn empty_file_yields_one_chunk() {
        let chunks = chunk_file("repo-global", "src/empty.rs", "", 700);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn chunk_ids_are_stable_across_reruns() {
        let text = "fn one() {}\n\nfn two() {}\n\nfn three() {}";
        let first = chunk_file("repo-global", "src/a.rs", text, 5);
        let second = chunk_file("repo-global", "src/a.rs", text, 5);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
        }
    }

    #[test]
    fn different_files_never_collide() {
        let a = chunk_id("repo-global", "src/a.rs", 0);
        let b = chunk_id("repo-global", "src/b.rs", 0);
        assert_ne!(a, b);
    }

    #[test]
    fn large_file_splits_into_multiple_contiguous_chunks() {
        let text = "fn one() {}\n\nfn two() {}\n\nfn three() {}\n\nfn four() {}";
        let chunks = chunk_file("repo-global", "src/a.rs", text, 3);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as u64);
        }
    }
}
