// Derive position deltas from two snapshots of a block.
//
// Myers shortest-edit-script over chars. Insertions and deletions are both
// reported in old-text coordinates so they feed `DeltaIndex` directly.

use super::{BlockTransform, PositionDelta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharEdit {
    Equal,
    Insert,
    Delete,
}

/// Computes the deltas that turn `old_text` into `new_text`.
///
/// Offsets and lengths count chars. Adjacent edits of the same kind are
/// coalesced into one delta.
pub fn deltas_from_text_diff(block_id: &str, old_text: &str, new_text: &str) -> Vec<PositionDelta> {
    if old_text == new_text {
        return Vec::new();
    }

    let old_chars: Vec<char> = old_text.chars().collect();
    let new_chars: Vec<char> = new_text.chars().collect();
    let edits = myers_char_edits(&old_chars, &new_chars);
    edits_to_deltas(block_id, &edits)
}

/// `Unchanged` when the texts match, otherwise `Modified` with diff deltas.
pub fn transform_from_texts(
    old_id: &str,
    new_id: &str,
    old_text: &str,
    new_text: &str,
) -> BlockTransform {
    let deltas = deltas_from_text_diff(old_id, old_text, new_text);
    if deltas.is_empty() {
        BlockTransform::Unchanged { old_id: old_id.to_string(), new_id: new_id.to_string() }
    } else {
        BlockTransform::Modified { old_id: old_id.to_string(), new_id: new_id.to_string(), deltas }
    }
}

fn myers_char_edits(old_chars: &[char], new_chars: &[char]) -> Vec<CharEdit> {
    let old_len = old_chars.len();
    let new_len = new_chars.len();

    if old_len == 0 {
        return vec![CharEdit::Insert; new_len];
    }
    if new_len == 0 {
        return vec![CharEdit::Delete; old_len];
    }

    let max = old_len + new_len;
    let offset = max as isize;
    let mut v = vec![0isize; 2 * max + 1];
    let mut trace: Vec<Vec<isize>> = Vec::with_capacity(max + 1);
    let mut solved_d = 0usize;

    'outer: for d in 0..=max {
        trace.push(v.clone());

        let d_isize = d as isize;
        let mut k = -d_isize;
        while k <= d_isize {
            let k_idx = (k + offset) as usize;
            let mut x = if k == -d_isize
                || (k != d_isize && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
            {
                v[(k + 1 + offset) as usize]
            } else {
                v[(k - 1 + offset) as usize] + 1
            };
            let mut y = x - k;

            while x < old_len as isize
                && y < new_len as isize
                && old_chars[x as usize] == new_chars[y as usize]
            {
                x += 1;
                y += 1;
            }

            v[k_idx] = x;

            if x >= old_len as isize && y >= new_len as isize {
                solved_d = d;
                break 'outer;
            }

            k += 2;
        }
    }

    backtrack_char_edits(old_len, new_len, &trace, solved_d, offset)
}

fn backtrack_char_edits(
    old_len: usize,
    new_len: usize,
    trace: &[Vec<isize>],
    solved_d: usize,
    offset: isize,
) -> Vec<CharEdit> {
    let mut edits = Vec::new();
    let mut x = old_len as isize;
    let mut y = new_len as isize;

    for d in (0..=solved_d).rev() {
        let v = &trace[d];
        let k = x - y;
        let d_isize = d as isize;

        let prev_k = if d == 0 {
            0
        } else if k == -d_isize
            || (k != d_isize && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = if d == 0 { 0 } else { v[(prev_k + offset) as usize] };
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(CharEdit::Equal);
            x -= 1;
            y -= 1;
        }

        if d == 0 {
            break;
        }

        if x == prev_x {
            edits.push(CharEdit::Insert);
            y -= 1;
        } else {
            edits.push(CharEdit::Delete);
            x -= 1;
        }
    }

    edits.reverse();
    edits
}

fn edits_to_deltas(block_id: &str, edits: &[CharEdit]) -> Vec<PositionDelta> {
    let mut deltas: Vec<PositionDelta> = Vec::new();
    let mut old_index = 0usize;

    for edit in edits {
        match edit {
            CharEdit::Equal => old_index += 1,
            CharEdit::Delete => {
                match deltas.last_mut() {
                    Some(last)
                        if last.delta < 0
                            && last.offset + last.delta.unsigned_abs() as usize == old_index =>
                    {
                        last.delta -= 1;
                    }
                    _ => deltas.push(PositionDelta::delete(block_id, old_index, 1)),
                }
                old_index += 1;
            }
            CharEdit::Insert => match deltas.last_mut() {
                Some(last) if last.delta > 0 && last.offset == old_index => last.delta += 1,
                _ => deltas.push(PositionDelta::insert(block_id, old_index, 1)),
            },
        }
    }

    deltas
}
