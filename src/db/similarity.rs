//! Exact and near-duplicate queries over computed hashes.

use rusqlite::Connection;
use std::collections::HashMap;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMember {
    pub id: i64,
    pub filepath: String,
    pub filename: String,
    pub size_bytes: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ExactDuplicateGroup {
    pub content_hash: String,
    /// Members in the catalog, which may exceed `members.len()`.
    pub total: usize,
    pub members: Vec<DuplicateMember>,
}

#[derive(Debug, Clone)]
pub struct NearDuplicatePair {
    pub a: DuplicateMember,
    pub b: DuplicateMember,
    pub distance: u32,
}

/// Hamming distance between two base64-encoded perceptual hashes.
/// `None` when either hash does not decode or the lengths differ.
pub fn hamming_distance(hash1: &str, hash2: &str) -> Option<u32> {
    use img_hash::ImageHash;

    let h1 = ImageHash::<Box<[u8]>>::from_base64(hash1).ok()?;
    let h2 = ImageHash::<Box<[u8]>>::from_base64(hash2).ok()?;
    if h1.as_bytes().len() != h2.as_bytes().len() {
        return None;
    }
    Some(h1.dist(&h2))
}

fn map_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<DuplicateMember> {
    Ok(DuplicateMember {
        id: row.get(0)?,
        filepath: row.get(1)?,
        filename: row.get(2)?,
        size_bytes: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
    })
}

/// Groups of two or more assets sharing a content hash, largest first.
pub fn find_exact_duplicates(conn: &Connection, max_members: usize) -> Result<Vec<ExactDuplicateGroup>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, filepath, filename, size_bytes, width, height, content_hash
        FROM assets
        WHERE hash_state = 'done' AND content_hash IN (
            SELECT content_hash FROM assets
            WHERE content_hash IS NOT NULL AND hash_state = 'done'
            GROUP BY content_hash
            HAVING COUNT(*) > 1
        )
        ORDER BY content_hash, filepath
        "#,
    )?;

    let mut by_hash: HashMap<String, ExactDuplicateGroup> = HashMap::new();
    let rows = stmt.query_map([], |row| Ok((map_member(row)?, row.get::<_, String>(6)?)))?;
    for row in rows {
        let (member, hash) = row?;
        let group = by_hash.entry(hash.clone()).or_insert_with(|| ExactDuplicateGroup {
            content_hash: hash,
            total: 0,
            members: Vec::new(),
        });
        group.total += 1;
        if group.members.len() < max_members {
            group.members.push(member);
        }
    }

    let mut groups: Vec<ExactDuplicateGroup> = by_hash.into_values().collect();
    groups.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.content_hash.cmp(&b.content_hash)));
    Ok(groups)
}

/// Image pairs whose perceptual hashes are within `threshold` bits.
/// Comparison stops once `max_pairs` pairs are found; the result is
/// sorted by ascending distance.
pub fn find_near_duplicates(conn: &Connection, threshold: u32, max_pairs: usize) -> Result<Vec<NearDuplicatePair>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, filepath, filename, size_bytes, width, height, perceptual_hash
        FROM assets
        WHERE kind = 'image' AND perceptual_hash IS NOT NULL AND hash_state = 'done'
        ORDER BY id
        "#,
    )?;
    let candidates = stmt
        .query_map([], |row| Ok((map_member(row)?, row.get::<_, String>(6)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut pairs = Vec::new();
    'outer: for (i, (a, hash_a)) in candidates.iter().enumerate() {
        for (b, hash_b) in candidates.iter().skip(i + 1) {
            if pairs.len() >= max_pairs {
                break 'outer;
            }
            if let Some(distance) = hamming_distance(hash_a, hash_b) {
                if distance <= threshold {
                    pairs.push(NearDuplicatePair {
                        a: a.clone(),
                        b: b.clone(),
                        distance,
                    });
                }
            }
        }
    }

    pairs.sort_by(|x, y| {
        x.distance
            .cmp(&y.distance)
            .then_with(|| x.a.id.cmp(&y.a.id))
            .then_with(|| x.b.id.cmp(&y.b.id))
    });
    Ok(pairs)
}
