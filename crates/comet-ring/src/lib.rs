// Ketama-style consistent hash ring used for client routing and rebalancing.
// Every comet node builds its own ring from the membership list, so the
// mapping must depend only on the set of node ids and the virtual count.
use sha2::{Digest, Sha256};

pub const DEFAULT_VNODES: usize = 255;

/// Consistent hash ring over node identifiers.
///
/// ```
/// use comet_ring::Ketama;
///
/// let ring = Ketama::new(["11", "22"], 255);
/// let owner = ring.locate("Terry-Mao335").expect("owner");
/// assert_eq!(Some(owner), Ketama::new(["22", "11"], 255).locate("Terry-Mao335"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Ketama {
    // Sorted ring positions; each maps to an index into `nodes`.
    points: Vec<(u32, usize)>,
    // Sorted, deduplicated node identifiers.
    nodes: Vec<String>,
    vnodes: usize,
}

impl Ketama {
    pub fn new<I, S>(nodes: I, vnodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes: Vec<String> = nodes.into_iter().map(Into::into).collect();
        // Sorting removes any dependence on the order the list arrived in.
        nodes.sort();
        nodes.dedup();
        let vnodes = vnodes.max(1);

        let mut points = Vec::with_capacity(nodes.len() * vnodes);
        for (index, node) in nodes.iter().enumerate() {
            for replica in 0..vnodes {
                points.push((hash_key(&format!("{node}#{replica}")), index));
            }
        }
        // Position collisions resolve to the lexicographically smallest node.
        points.sort_unstable();
        points.dedup_by_key(|(position, _)| *position);

        Self {
            points,
            nodes,
            vnodes,
        }
    }

    /// Node owning `key`, or `None` for an empty ring.
    pub fn locate(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let slot = self.points.partition_point(|(position, _)| *position < hash);
        // Past the last position wraps around to the first.
        let (_, index) = self.points[slot % self.points.len()];
        Some(self.nodes[index].as_str())
    }

    /// True when `key` maps to `node` (an empty ring owns nothing).
    pub fn owns(&self, node: &str, key: &str) -> bool {
        self.locate(key) == Some(node)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.binary_search_by(|probe| probe.as_str().cmp(node)).is_ok()
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn vnodes(&self) -> usize {
        self.vnodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// First four digest bytes as a big-endian ring position.
fn hash_key(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
