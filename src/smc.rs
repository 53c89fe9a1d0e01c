use rand::Rng;

use crate::node::Nodes;
use crate::recombination::Recombination;
use crate::tree::LineageCounts;
use crate::tree::Tree;
use crate::Branch;

// One constant-rate piece of a candidate source branch.
#[derive(Debug)]
struct Segment {
    source: Branch,
    lower: f64,
    upper: f64,
    lineages: f64,
    weight: f64,
}

/// Samples the source branch and start time of recombination
/// events under SMC'.
#[derive(Clone, Copy, Debug, Default)]
pub struct SmcSampler;

impl SmcSampler {
    pub fn new() -> Self {
        Self
    }

    // Admissible start times on `source`.
    fn window(nodes: &Nodes, r: &Recombination, source: Branch) -> (f64, f64) {
        let (Some(p), Some(q)) = (r.deleted_node(), r.inserted_node()) else {
            panic!("recombination at {} has no derivable nodes", r.pos());
        };
        (
            nodes.time(source.lower),
            nodes.time(p).min(nodes.time(q)),
        )
    }

    fn is_valid(nodes: &Nodes, r: &Recombination) -> bool {
        let source = r.source_branch();
        if source.is_null() || !r.source_candidates().contains(&source) {
            return false;
        }
        let (lower, upper) = Self::window(nodes, r, source);
        let t = r.start_time();
        t > 0.0 && t >= lower && t <= upper
    }

    fn check(nodes: &Nodes, r: &Recombination) {
        let source = r.source_branch();
        let (_, upper) = Self::window(nodes, r, source);
        assert!(
            r.start_time() > 0.0 && r.start_time() <= upper,
            "invalid start time {} for recombination at {}",
            r.start_time(),
            r.pos()
        );
    }

    fn candidates(r: &Recombination) -> Vec<Branch> {
        let candidates = r.source_candidates();
        assert!(
            !candidates.is_empty(),
            "no source branch for recombination at {}",
            r.pos()
        );
        candidates
    }

    /// Sample from the SMC' density of the break point given the
    /// trees on both sides of `r`. `tree` is the tree just before it.
    ///
    /// Events whose current start time is valid and below `ref_time`
    /// are left as they are.
    pub fn sample_recombination<R: Rng>(
        &self,
        r: &mut Recombination,
        ref_time: f64,
        tree: &Tree,
        nodes: &Nodes,
        rng: &mut R,
    ) {
        if Self::is_valid(nodes, r) && r.start_time() < ref_time {
            return;
        }
        let Some(q) = r.inserted_node() else {
            panic!("recombination at {} has no inserted node", r.pos());
        };
        let q_time = nodes.time(q);
        let counts = LineageCounts::new(tree, nodes);

        let mut segments = vec![];
        for source in Self::candidates(r) {
            let (lower, upper) = Self::window(nodes, r, source);
            let mut cuts = vec![lower];
            cuts.extend(
                counts
                    .breakpoints()
                    .iter()
                    .copied()
                    .filter(|&t| t > lower && t < upper),
            );
            cuts.push(upper);
            for w in cuts.windows(2) {
                let (a, b) = (w[0], w[1]);
                if b <= a {
                    continue;
                }
                let k = counts.count_at(a) as f64;
                let mass = if k > 0.0 {
                    (1.0 - (-k * (b - a)).exp()) / k
                } else {
                    b - a
                };
                segments.push(Segment {
                    source,
                    lower: a,
                    upper: b,
                    lineages: k,
                    weight: (-counts.integrate(b, q_time)).exp() * mass,
                });
            }
        }

        let total: f64 = segments.iter().map(|s| s.weight).sum();
        if !(total > 0.0 && total.is_finite()) {
            self.approx_sample_recombination(r, 0.0, nodes, rng);
            return;
        }
        let mut u = rng.gen::<f64>() * total;
        let mut chosen = segments.last();
        for s in &segments {
            if u <= s.weight {
                chosen = Some(s);
                break;
            }
            u -= s.weight;
        }
        let Some(s) = chosen else {
            panic!("no admissible start time for recombination at {}", r.pos());
        };
        let v = rng.gen::<f64>();
        let t = if s.lineages > 0.0 {
            let span = s.upper - s.lower;
            s.upper + (1.0 - v * (1.0 - (-s.lineages * span).exp())).ln() / s.lineages
        } else {
            s.lower + (s.upper - s.lower) * (1.0 - v)
        };
        r.set_source(s.source, t.clamp(f64::MIN_POSITIVE, s.upper));
        Self::check(nodes, r);
    }

    /// Pick a source with probability proportional to its admissible
    /// interval and a start time uniformly within it.
    pub fn approx_sample_recombination<R: Rng>(
        &self,
        r: &mut Recombination,
        ref_time: f64,
        nodes: &Nodes,
        rng: &mut R,
    ) {
        if Self::is_valid(nodes, r) && r.start_time() < ref_time {
            return;
        }
        self.resample(r, 0.0, nodes, rng);
    }

    /// Resample the event only if its start time is invalid or not
    /// above `baseline`.
    pub fn adjust<R: Rng>(&self, r: &mut Recombination, baseline: f64, nodes: &Nodes, rng: &mut R) {
        if Self::is_valid(nodes, r) && r.start_time() > baseline {
            return;
        }
        self.resample(r, baseline, nodes, rng);
    }

    fn resample<R: Rng>(&self, r: &mut Recombination, baseline: f64, nodes: &Nodes, rng: &mut R) {
        let windows = Self::candidates(r)
            .into_iter()
            .map(|source| {
                let (lower, upper) = Self::window(nodes, r, source);
                (source, lower, upper)
            })
            .collect::<Vec<_>>();
        let raised = windows
            .iter()
            .map(|&(source, lower, upper)| (source, lower.max(baseline), upper))
            .filter(|&(_, lower, upper)| upper > lower)
            .collect::<Vec<_>>();
        let windows = if raised.is_empty() { windows } else { raised };

        let total: f64 = windows.iter().map(|(_, l, u)| (u - l).max(0.0)).sum();
        let mut x = rng.gen::<f64>() * total;
        let mut chosen = windows[windows.len() - 1];
        for &w in &windows {
            let width = (w.2 - w.1).max(0.0);
            if x <= width {
                chosen = w;
                break;
            }
            x -= width;
        }
        let (source, lower, upper) = chosen;
        let t = lower + (upper - lower) * (1.0 - rng.gen::<f64>());
        r.set_source(source, t.max(f64::MIN_POSITIVE));
        Self::check(nodes, r);
    }
}

#[cfg(test)]
mod test_smc_sampler {
    use super::*;
    use crate::node::Node;
    use crate::NodeId;
    use crate::Position;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn b(lower: usize, upper: usize) -> Branch {
        Branch::new(NodeId::new(lower), NodeId::new(upper))
    }

    fn setup() -> (Nodes, Tree, Recombination) {
        let mut nodes = Nodes::new();
        for t in [0.0, 0.0, 0.0, 1.0, 2.0, 1.5] {
            nodes.push(Node::new(t));
        }
        let mut tree = Tree::new();
        for branch in [b(0, 3), b(1, 3), b(3, 4), b(2, 4)] {
            tree.insert_branch(branch);
        }
        tree.insert_branch(Branch::new(NodeId::new(4), NodeId::ROOT));
        let r = Recombination::new(
            Position::new(50.0),
            [b(0, 3), b(1, 3), b(3, 4), b(2, 4)].into_iter().collect(),
            [b(1, 4), b(0, 5), b(2, 5), b(5, 4)].into_iter().collect(),
        );
        (nodes, tree, r)
    }

    #[test]
    fn test_sample_recombination_bounds() {
        let (nodes, tree, mut r) = setup();
        let sampler = SmcSampler::new();
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            r.set_source(b(0, 3), 0.0);
            sampler.sample_recombination(&mut r, 0.0, &tree, &nodes, &mut rng);
            assert_eq!(r.source_branch(), b(0, 3));
            assert!(r.start_time() > 0.0);
            assert!(r.start_time() <= 1.0);
        }
    }

    #[test]
    fn test_valid_event_below_reference_is_kept() {
        let (nodes, tree, mut r) = setup();
        let sampler = SmcSampler::new();
        let mut rng = StdRng::seed_from_u64(6);
        r.set_source(b(0, 3), 0.25);
        sampler.sample_recombination(&mut r, 1.0, &tree, &nodes, &mut rng);
        assert_eq!(r.start_time(), 0.25);
        sampler.approx_sample_recombination(&mut r, 1.0, &nodes, &mut rng);
        assert_eq!(r.start_time(), 0.25);
        // above the reference time the event is resampled
        sampler.approx_sample_recombination(&mut r, 0.1, &nodes, &mut rng);
        assert!(r.start_time() > 0.0 && r.start_time() <= 1.0);
    }

    #[test]
    fn test_adjust_respects_baseline() {
        let (nodes, _, mut r) = setup();
        let sampler = SmcSampler::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            r.set_source(b(0, 3), 0.25);
            sampler.adjust(&mut r, 0.6, &nodes, &mut rng);
            assert!(r.start_time() > 0.6);
            assert!(r.start_time() <= 1.0);
        }
        r.set_source(b(0, 3), 0.8);
        sampler.adjust(&mut r, 0.6, &nodes, &mut rng);
        assert_eq!(r.start_time(), 0.8);
    }
}
