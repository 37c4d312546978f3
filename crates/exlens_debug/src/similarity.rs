//! Ratcliff/Obershelp similarity between identifiers.

pub const DEFAULT_THRESHOLD: f64 = 0.75;

/// Lower-cases and drops underscores, so `__lower__` and `Lower` compare equal.
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Longest common block of `a[alo..ahi]` and `b[blo..bhi]`.
///
/// Ties go to the block starting earliest in `a`, then earliest in `b`.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);
    let width = bhi - blo + 1;
    let mut previous = vec![0usize; width];
    let mut current = vec![0usize; width];
    for i in alo..ahi {
        for j in blo..bhi {
            let slot = j - blo + 1;
            if a[i] == b[j] {
                let size = previous[slot - 1] + 1;
                current[slot] = size;
                if size > best_size {
                    best_i = i + 1 - size;
                    best_j = j + 1 - size;
                    best_size = size;
                }
            } else {
                current[slot] = 0;
            }
        }
        std::mem::swap(&mut previous, &mut current);
    }
    (best_i, best_j, best_size)
}

/// Total size of the matching blocks found by recursive longest-match search.
fn matched_chars(a: &[char], b: &[char]) -> usize {
    let mut total = 0;
    let mut queue = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        if alo >= ahi || blo >= bhi {
            continue;
        }
        let (i, j, size) = longest_match(a, b, alo, ahi, blo, bhi);
        if size == 0 {
            continue;
        }
        total += size;
        queue.push((alo, i, blo, j));
        queue.push((i + size, ahi, j + size, bhi));
    }
    total
}

/// `2 * M / T` over the raw strings; two empty strings score 1.0.
pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matched_chars(&a, &b) as f64 / total as f64
}

pub fn similar(a: &str, b: &str) -> bool {
    similar_with(a, b, DEFAULT_THRESHOLD)
}

pub fn similar_with(a: &str, b: &str, threshold: f64) -> bool {
    ratio(&normalize(a), &normalize(b)) >= threshold
}

/// Candidates similar to `name`, in candidate order, without duplicates.
pub fn suggestions<I, S>(name: &str, candidates: I, threshold: f64, limit: Option<usize>) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let target = normalize(name);
    let mut found: Vec<String> = Vec::new();
    for candidate in candidates {
        if limit.is_some_and(|limit| found.len() >= limit) {
            break;
        }
        let candidate = candidate.as_ref();
        if found.iter().any(|seen| seen == candidate) {
            continue;
        }
        if ratio(&target, &normalize(candidate)) >= threshold {
            found.push(candidate.to_string());
        }
    }
    found
}
