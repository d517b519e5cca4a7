//! Association correlation.
//!
//! SCTP has no connection identifier on the wire, only the verification tag
//! each endpoint chose at setup. Packets are grouped into associations by an
//! ordered table of match rules over ports and tags, evaluated against every
//! known association newest-first. Tags learned late (the peer's tag only
//! shows up once it sends) are filled in from zero, never overwritten.

use std::fmt;

use serde::Serialize;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Same orientation as the packet that created the association.
    Forward,
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

/// What one packet says about the association it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub src_port: u16,
    pub dst_port: u16,
    /// The packet's own verification tag, or 0 when the tag is reflected.
    pub tag1: u32,
    /// The reflected tag (ABORT / SHUTDOWN_COMPLETE with the T bit), else 0.
    pub tag2: u32,
    /// Initiate tag of an INIT chunk, else 0.
    pub initiate_tag: u32,
}

impl Candidate {
    pub fn new(src_port: u16, dst_port: u16, vtag: u32, reflected: bool, initiate_tag: u32) -> Self {
        let (tag1, tag2) = if reflected { (0, vtag) } else { (vtag, 0) };
        Candidate {
            src_port,
            dst_port,
            tag1,
            tag2,
            initiate_tag,
        }
    }

    fn same_ports(&self, a: &Association) -> bool {
        self.src_port == a.src_port && self.dst_port == a.dst_port
    }

    fn swapped_ports(&self, a: &Association) -> bool {
        self.src_port == a.dst_port && self.dst_port == a.src_port
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Association {
    pub index: usize,
    pub src_port: u16,
    pub dst_port: u16,
    /// Tag carried by forward packets.
    pub tag1: u32,
    /// Tag carried by backward packets.
    pub tag2: u32,
    pub initiate_tag: u32,
    /// Chunks resolved to this association on the first pass.
    pub chunks: u64,
    /// First-pass frames carrying at least one of those chunks.
    pub frames: u64,
}

/// Outcome of a rule that matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Forward,
    Backward,
    /// Forward; the association learns `tag1` from the candidate.
    ForwardFillTag1,
    /// Backward; the association learns `tag1` from the candidate's own tag.
    BackwardFillTag1,
    /// Backward; the association learns `tag2` from the candidate's own tag.
    BackwardFillTag2,
    /// The association certainly is not this one; try the next.
    Reject,
}

impl Outcome {
    fn direction(self) -> Option<Direction> {
        match self {
            Outcome::Forward | Outcome::ForwardFillTag1 => Some(Direction::Forward),
            Outcome::Backward | Outcome::BackwardFillTag1 | Outcome::BackwardFillTag2 => {
                Some(Direction::Backward)
            }
            Outcome::Reject => None,
        }
    }
}

struct Rule {
    name: &'static str,
    matches: fn(&Candidate, &Association) -> bool,
    outcome: Outcome,
}

/// Evaluated in order; the first rule that matches decides.
const RULES: &[Rule] = &[
    Rule {
        name: "init-retransmit",
        matches: |c, a| {
            c.same_ports(a)
                && a.tag2 != 0
                && c.initiate_tag == a.tag2
                && c.initiate_tag == a.initiate_tag
        },
        outcome: Outcome::Forward,
    },
    Rule {
        name: "forward-exact",
        matches: |c, a| c.same_ports(a) && c.tag1 == a.tag1 && c.initiate_tag == a.initiate_tag,
        outcome: Outcome::Forward,
    },
    Rule {
        name: "distinct-init",
        matches: |c, a| {
            c.same_ports(a)
                && c.tag1 == a.tag1
                && c.tag1 == 0
                && c.initiate_tag != 0
                && c.initiate_tag != a.initiate_tag
        },
        outcome: Outcome::Reject,
    },
    Rule {
        name: "forward-known",
        matches: |c, a| c.same_ports(a) && c.tag1 == a.tag1 && (c.tag1 != 0 || a.tag2 != 0),
        outcome: Outcome::Forward,
    },
    Rule {
        name: "forward-reflected",
        matches: |c, a| c.same_ports(a) && c.tag2 == a.tag2 && c.tag1 == 0 && a.tag1 != 0,
        outcome: Outcome::Forward,
    },
    Rule {
        name: "backward-tag",
        matches: |c, a| c.swapped_ports(a) && c.tag1 == a.tag2 && c.tag1 != 0,
        outcome: Outcome::Backward,
    },
    Rule {
        name: "backward-reflected-tag",
        matches: |c, a| c.swapped_ports(a) && c.tag2 == a.tag1 && c.tag2 != 0,
        outcome: Outcome::Backward,
    },
    Rule {
        name: "init-ack",
        matches: |c, a| c.swapped_ports(a) && c.tag1 == a.initiate_tag && c.tag2 == 0,
        outcome: Outcome::BackwardFillTag2,
    },
    Rule {
        name: "backward-reflected",
        matches: |c, a| c.swapped_ports(a) && c.tag2 == a.tag1 && c.tag1 == 0 && a.tag2 != 0,
        outcome: Outcome::Backward,
    },
    Rule {
        name: "forward-fill",
        matches: |c, a| c.same_ports(a) && c.tag1 != 0 && a.tag1 == 0 && a.tag2 != 0,
        outcome: Outcome::ForwardFillTag1,
    },
    Rule {
        name: "backward-fill-forward",
        matches: |c, a| c.swapped_ports(a) && c.tag1 == a.tag2 && a.tag1 == 0,
        outcome: Outcome::BackwardFillTag1,
    },
    Rule {
        name: "backward-fill",
        matches: |c, a| c.swapped_ports(a) && c.tag1 != 0 && a.tag1 != 0 && a.tag2 == 0,
        outcome: Outcome::BackwardFillTag2,
    },
];

fn evaluate(candidate: &Candidate, assoc: &Association) -> Option<&'static Rule> {
    RULES.iter().find(|rule| (rule.matches)(candidate, assoc))
}

/// A resolved association for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub index: usize,
    pub direction: Direction,
    /// The association was allocated by this packet.
    pub created: bool,
}

/// All associations of one capture. Indices are allocation order.
#[derive(Debug, Default)]
pub struct Correlator {
    associations: Vec<Association>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    pub fn get(&self, index: usize) -> Option<&Association> {
        self.associations.get(index)
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }

    pub fn clear(&mut self) {
        self.associations.clear();
    }

    /// Count one frame against each association in `indices`, which must
    /// hold every index at most once.
    pub fn count_frame(&mut self, indices: impl IntoIterator<Item = usize>) {
        for index in indices {
            if let Some(assoc) = self.associations.get_mut(index) {
                assoc.frames += 1;
            }
        }
    }

    /// First-pass resolution: rules with tag completion, allocating a new
    /// association when nothing matches.
    pub fn resolve(&mut self, candidate: &Candidate) -> Resolution {
        for assoc in self.associations.iter_mut().rev() {
            let Some(rule) = evaluate(candidate, assoc) else {
                continue;
            };
            let Some(direction) = rule.outcome.direction() else {
                trace!(index = assoc.index, rule = rule.name, "association rejected");
                continue;
            };
            apply_fill(assoc, candidate, rule.outcome);
            assoc.chunks += 1;
            trace!(index = assoc.index, rule = rule.name, %direction, "association matched");
            return Resolution {
                index: assoc.index,
                direction,
                created: false,
            };
        }
        self.allocate(candidate)
    }

    /// Resolution for a chunk of an already processed frame that has no
    /// recorded first-pass resolution. Exact tag and port equality is tried
    /// first, then the rules without tag completion. Allocates only when
    /// neither matches.
    pub fn resolve_replay(&mut self, candidate: &Candidate) -> Resolution {
        for assoc in self.associations.iter().rev() {
            if let Some(direction) = exact_match(candidate, assoc) {
                return Resolution {
                    index: assoc.index,
                    direction,
                    created: false,
                };
            }
        }
        for assoc in self.associations.iter().rev() {
            if let Some(direction) = evaluate(candidate, assoc).and_then(|r| r.outcome.direction()) {
                return Resolution {
                    index: assoc.index,
                    direction,
                    created: false,
                };
            }
        }
        self.allocate(candidate)
    }

    fn allocate(&mut self, candidate: &Candidate) -> Resolution {
        let index = self.associations.len();
        self.associations.push(Association {
            index,
            src_port: candidate.src_port,
            dst_port: candidate.dst_port,
            tag1: candidate.tag1,
            tag2: candidate.tag2,
            initiate_tag: candidate.initiate_tag,
            chunks: 1,
            frames: 0,
        });
        debug!(
            index,
            src_port = candidate.src_port,
            dst_port = candidate.dst_port,
            tag1 = candidate.tag1,
            tag2 = candidate.tag2,
            "new association"
        );
        Resolution {
            index,
            direction: Direction::Forward,
            created: true,
        }
    }
}

fn apply_fill(assoc: &mut Association, candidate: &Candidate, outcome: Outcome) {
    let (slot, name) = match outcome {
        Outcome::ForwardFillTag1 | Outcome::BackwardFillTag1 => (&mut assoc.tag1, "tag1"),
        Outcome::BackwardFillTag2 => (&mut assoc.tag2, "tag2"),
        _ => return,
    };
    // Tags are only ever learned, never replaced.
    if *slot == 0 && candidate.tag1 != 0 {
        *slot = candidate.tag1;
        debug!(
            index = assoc.index,
            tag = name,
            value = candidate.tag1,
            "association tag learned"
        );
    }
}

fn exact_match(c: &Candidate, a: &Association) -> Option<Direction> {
    if c.same_ports(a)
        && ((c.tag1 != 0 && c.tag1 == a.tag1)
            || (c.tag2 != 0 && c.tag2 == a.tag2)
            || (c.initiate_tag != 0 && c.initiate_tag == a.initiate_tag))
    {
        return Some(Direction::Forward);
    }
    if c.swapped_ports(a)
        && ((c.tag1 != 0 && c.tag1 == a.tag2) || (c.tag2 != 0 && c.tag2 == a.tag1))
    {
        return Some(Direction::Backward);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fwd(vtag: u32) -> Candidate {
        Candidate::new(5000, 9, vtag, false, 0)
    }

    fn bwd(vtag: u32) -> Candidate {
        Candidate::new(9, 5000, vtag, false, 0)
    }

    fn assoc(tag1: u32, tag2: u32, initiate_tag: u32) -> Association {
        Association {
            index: 0,
            src_port: 5000,
            dst_port: 9,
            tag1,
            tag2,
            initiate_tag,
            chunks: 1,
            frames: 1,
        }
    }

    fn rule_name(c: &Candidate, a: &Association) -> Option<&'static str> {
        evaluate(c, a).map(|r| r.name)
    }

    #[test]
    fn candidate_from_reflected_tag() {
        let c = Candidate::new(1, 2, 0x55, true, 0);
        assert_eq!((c.tag1, c.tag2), (0, 0x55));
        let c = Candidate::new(1, 2, 0x55, false, 0);
        assert_eq!((c.tag1, c.tag2), (0x55, 0));
    }

    #[test]
    fn rule_init_retransmit() {
        let c = Candidate::new(5000, 9, 0, false, 0x77);
        assert_eq!(rule_name(&c, &assoc(0, 0x77, 0x77)), Some("init-retransmit"));
    }

    #[test]
    fn rule_forward_exact() {
        assert_eq!(rule_name(&fwd(0x10), &assoc(0x10, 0, 0)), Some("forward-exact"));
    }

    #[test]
    fn rule_distinct_init_rejects() {
        let c = Candidate::new(5000, 9, 0, false, 0x99);
        let a = assoc(0, 0, 0x11);
        assert_eq!(rule_name(&c, &a), Some("distinct-init"));
        assert_eq!(evaluate(&c, &a).unwrap().outcome.direction(), None);
    }

    #[test]
    fn rule_forward_known() {
        assert_eq!(rule_name(&fwd(0x10), &assoc(0x10, 0x20, 0x20)), Some("forward-known"));
    }

    #[test]
    fn rule_forward_reflected() {
        let c = Candidate::new(5000, 9, 0x20, true, 0);
        assert_eq!(rule_name(&c, &assoc(0x10, 0x20, 0)), Some("forward-reflected"));
    }

    #[test]
    fn rule_backward_tag() {
        assert_eq!(rule_name(&bwd(0x20), &assoc(0x10, 0x20, 0)), Some("backward-tag"));
    }

    #[test]
    fn rule_backward_reflected_tag() {
        let c = Candidate::new(9, 5000, 0x10, true, 0);
        assert_eq!(rule_name(&c, &assoc(0x10, 0x20, 0)), Some("backward-reflected-tag"));
    }

    #[test]
    fn rule_init_ack() {
        assert_eq!(rule_name(&bwd(0x77), &assoc(0, 0, 0x77)), Some("init-ack"));
    }

    #[test]
    fn rule_forward_fill() {
        assert_eq!(rule_name(&fwd(0x10), &assoc(0, 0x20, 0x20)), Some("forward-fill"));
    }

    #[test]
    fn rule_backward_fill_forward() {
        let a = Association {
            tag1: 0,
            tag2: 0x20,
            ..assoc(0, 0, 0)
        };
        let c = Candidate::new(9, 5000, 0x20, false, 0);
        assert_eq!(rule_name(&c, &a), Some("backward-tag"));
        let c = Candidate {
            tag1: 0,
            tag2: 0,
            ..c
        };
        assert_eq!(rule_name(&c, &assoc(0, 0, 5)), Some("backward-fill-forward"));
    }

    #[test]
    fn rule_backward_fill() {
        assert_eq!(rule_name(&bwd(0x20), &assoc(0x10, 0, 0)), Some("backward-fill"));
    }

    #[test]
    fn unrelated_ports_do_not_match() {
        let c = Candidate::new(1, 2, 0x10, false, 0);
        assert_eq!(rule_name(&c, &assoc(0x10, 0x20, 0)), None);
    }

    #[test]
    fn handshake_builds_one_association() {
        let mut corr = Correlator::new();
        // INIT: vtag 0, initiate tag A
        let r = corr.resolve(&Candidate::new(5000, 9, 0, false, 0xaaaa));
        assert_eq!((r.index, r.direction, r.created), (0, Direction::Forward, true));
        // INIT_ACK carries A
        let r = corr.resolve(&bwd(0xaaaa));
        assert_eq!((r.index, r.direction), (0, Direction::Backward));
        assert_eq!(corr.get(0).unwrap().tag2, 0xaaaa);
        // COOKIE_ECHO carries B (the INIT_ACK initiate tag)
        let r = corr.resolve(&fwd(0xbbbb));
        assert_eq!((r.index, r.direction), (0, Direction::Forward));
        assert_eq!(corr.get(0).unwrap().tag1, 0xbbbb);
        // COOKIE_ACK
        let r = corr.resolve(&bwd(0xaaaa));
        assert_eq!((r.index, r.direction), (0, Direction::Backward));
        assert_eq!(corr.len(), 1);
        assert_eq!(corr.get(0).unwrap().chunks, 4);
    }

    #[test]
    fn mid_stream_pair_correlates() {
        let mut corr = Correlator::new();
        let a = corr.resolve(&fwd(0x1111));
        let b = corr.resolve(&bwd(0x2222));
        assert_eq!(a.index, b.index);
        assert_eq!(a.direction, Direction::Forward);
        assert_eq!(b.direction, Direction::Backward);
        let c = corr.resolve(&fwd(0x1111));
        assert_eq!((c.index, c.direction), (0, Direction::Forward));
    }

    #[test]
    fn two_inits_with_different_initiate_tags_stay_separate() {
        let mut corr = Correlator::new();
        let a = corr.resolve(&Candidate::new(5000, 9, 0, false, 0x1));
        let b = corr.resolve(&Candidate::new(5000, 9, 0, false, 0x2));
        assert_ne!(a.index, b.index);
        assert!(b.created);
        assert_eq!(corr.len(), 2);
    }

    #[test]
    fn newest_association_wins() {
        let mut corr = Correlator::new();
        corr.resolve(&Candidate::new(5000, 9, 0, false, 0x1));
        corr.resolve(&Candidate::new(5000, 9, 0, false, 0x2));
        // The INIT_ACK echoes the second initiate tag only.
        let r = corr.resolve(&bwd(0x2));
        assert_eq!(r.index, 1);
        assert_eq!(corr.get(1).unwrap().tag2, 0x2);
        assert_eq!(corr.get(0).unwrap().tag2, 0);
    }

    #[test]
    fn learned_tags_are_never_replaced() {
        let mut a = assoc(0x10, 0x20, 0x30);
        apply_fill(&mut a, &bwd(0x99), Outcome::BackwardFillTag2);
        assert_eq!(a.tag2, 0x20);
        let mut a = assoc(0, 0x20, 0);
        apply_fill(&mut a, &fwd(0x10), Outcome::ForwardFillTag1);
        assert_eq!(a.tag1, 0x10);
    }

    #[test]
    fn replay_uses_exact_tags_without_learning() {
        let mut corr = Correlator::new();
        corr.resolve(&fwd(0x1111));
        corr.resolve(&bwd(0x2222));
        let before = corr.associations().to_vec();

        let r = corr.resolve_replay(&bwd(0x2222));
        assert_eq!((r.index, r.direction), (0, Direction::Backward));
        let r = corr.resolve_replay(&fwd(0x1111));
        assert_eq!((r.index, r.direction), (0, Direction::Forward));
        assert_eq!(corr.associations(), &before[..]);
    }
}
