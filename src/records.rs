//! Text records of an ARG.
//!
//! Four whitespace-separated streams describe a graph:
//!
//! * nodes: one time, scaled by `Ne`, per line. The line number is
//!   the node index.
//! * branches: `upper lower left right`, one line per maximal run of
//!   an edge along the sequence. The root has index `-1`.
//! * recombinations: `position lower upper start_time`, the source
//!   branch and scaled start time of each breakpoint.
//! * mutations: `position lower upper state`, one line per mapped
//!   branch of a site, with the state of its lower node.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::info;

use crate::arg::Arg;
use crate::error::ArgError;
use crate::error::Result;
use crate::recombination::Recombination;
use crate::tree::Tree;
use crate::Branch;
use crate::BranchSet;
use crate::NodeId;
use crate::NodeMap;
use crate::Position;

/// Open `path` for buffered reading.
pub(crate) fn open_input(path: &Path) -> Result<BufReader<File>> {
    if !path.exists() {
        return Err(ArgError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(BufReader::new(File::open(path)?))
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path)?))
}

/// Paths of the record files of one graph.
#[derive(Clone, Debug, Default)]
pub struct ArgFiles {
    pub nodes: PathBuf,
    pub branches: PathBuf,
    pub recombinations: Option<PathBuf>,
    pub mutations: Option<PathBuf>,
}

impl ArgFiles {
    pub fn new(nodes: impl Into<PathBuf>, branches: impl Into<PathBuf>) -> Self {
        Self {
            nodes: nodes.into(),
            branches: branches.into(),
            ..Self::default()
        }
    }

    pub fn with_recombinations(mut self, path: impl Into<PathBuf>) -> Self {
        self.recombinations = Some(path.into());
        self
    }

    pub fn with_mutations(mut self, path: impl Into<PathBuf>) -> Self {
        self.mutations = Some(path.into());
        self
    }
}

// Non-empty lines split on whitespace, numbered from one.
fn records<R: BufRead>(
    reader: R,
    columns: usize,
) -> impl Iterator<Item = Result<(usize, Vec<String>)>> {
    reader
        .lines()
        .enumerate()
        .filter_map(move |(i, line)| {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            let fields = line
                .split_whitespace()
                .map(str::to_owned)
                .collect::<Vec<_>>();
            if fields.is_empty() {
                return None;
            }
            if fields.len() != columns {
                return Some(Err(ArgError::parse(
                    i + 1,
                    format!("expected {columns} columns, got {}", fields.len()),
                )));
            }
            Some(Ok((i + 1, fields)))
        })
}

fn parse<T: FromStr>(field: &str, line: usize) -> Result<T> {
    field
        .parse()
        .map_err(|_| ArgError::parse(line, format!("invalid value {field}")))
}

impl Arg {
    // Output index of every node reachable from the events, ordered
    // by time.
    fn output_indices(&self) -> NodeMap<i64> {
        let mut referenced = self.sample_nodes.clone();
        for r in self.recombinations.values() {
            for b in r.inserted_branches() {
                referenced.extend([b.lower, b.upper]);
            }
        }
        referenced.retain(|n| n.as_index().is_some());
        let mut ordered = referenced.into_iter().collect::<Vec<_>>();
        ordered.sort_by(|a, b| {
            self.nodes
                .time(*a)
                .total_cmp(&self.nodes.time(*b))
                .then(a.cmp(b))
        });
        let mut indices = ordered
            .into_iter()
            .enumerate()
            .map(|(i, n)| (n, i as i64))
            .collect::<NodeMap<_>>();
        indices.insert(NodeId::ROOT, -1);
        indices
    }

    fn output_index(indices: &NodeMap<i64>, node: NodeId) -> i64 {
        match indices.get(&node) {
            Some(&i) => i,
            None => panic!("{node:?} is not part of the graph"),
        }
    }

    fn node_from_index(&self, index: i64, line: usize) -> Result<NodeId> {
        if index == -1 {
            return Ok(NodeId::ROOT);
        }
        match usize::try_from(index) {
            Ok(i) if i < self.nodes.len() => Ok(NodeId::new(i)),
            _ => Err(ArgError::parse(line, format!("no node with index {index}"))),
        }
    }

    fn assert_no_rewiring(&self) {
        assert!(
            !self.nodes.has_cut(),
            "cannot write a graph while a lineage is detached"
        );
    }

    pub fn write_nodes<W: Write>(&self, mut writer: W) -> Result<()> {
        self.assert_no_rewiring();
        let indices = self.output_indices();
        let mut ordered = indices
            .iter()
            .filter(|&(&n, _)| n != NodeId::ROOT)
            .map(|(&n, &i)| (i, n))
            .collect::<Vec<_>>();
        ordered.sort();
        for (_, n) in ordered {
            writeln!(writer, "{}", self.nodes.time(n) * self.ne)?;
        }
        Ok(())
    }

    pub fn write_branches<W: Write>(&self, mut writer: W) -> Result<()> {
        self.assert_no_rewiring();
        let indices = self.output_indices();
        let length = self.length_pos();
        let mut open = BTreeMap::<Branch, Position>::new();
        let mut rows = vec![];
        for (&pos, r) in self.recombinations.range(..length) {
            for b in r.deleted_branches() {
                let left = open.remove(b).unwrap_or(Position::ZERO);
                rows.push((*b, left, pos));
            }
            for &b in r.inserted_branches() {
                open.insert(b, pos);
            }
        }
        rows.extend(open.into_iter().map(|(b, left)| (b, left, length)));

        let mut rows = rows
            .into_iter()
            .map(|(b, left, right)| {
                (
                    Self::output_index(&indices, b.upper),
                    Self::output_index(&indices, b.lower),
                    left,
                    right,
                )
            })
            .collect::<Vec<_>>();
        rows.sort();
        for (upper, lower, left, right) in rows {
            writeln!(writer, "{upper} {lower} {left} {right}")?;
        }
        Ok(())
    }

    pub fn write_recombinations<W: Write>(&self, mut writer: W) -> Result<()> {
        self.assert_no_rewiring();
        let indices = self.output_indices();
        for (&pos, r) in self.recombinations.range(..self.length_pos()) {
            let source = r.source_branch();
            if r.is_boundary() || source.is_null() {
                continue;
            }
            writeln!(
                writer,
                "{pos} {} {} {}",
                Self::output_index(&indices, source.lower),
                Self::output_index(&indices, source.upper),
                r.start_time() * self.ne
            )?;
        }
        Ok(())
    }

    pub fn write_mutations<W: Write>(&self, mut writer: W) -> Result<()> {
        self.assert_no_rewiring();
        let indices = self.output_indices();
        for (&m, mapped) in self.mutation_branches.range(..self.length_pos()) {
            for b in mapped {
                writeln!(
                    writer,
                    "{m} {} {} {}",
                    Self::output_index(&indices, b.lower),
                    Self::output_index(&indices, b.upper),
                    self.nodes.state(b.lower, m)
                )?;
            }
        }
        Ok(())
    }

    pub fn write_coordinates<W: Write>(&self, mut writer: W) -> Result<()> {
        for x in &self.coordinates {
            writeln!(writer, "{x}")?;
        }
        Ok(())
    }

    pub fn read_nodes<R: BufRead>(&mut self, reader: R) -> Result<()> {
        for record in records(reader, 1) {
            let (line, fields) = record?;
            let t: f64 = parse(&fields[0], line)?;
            if !(t.is_finite() && t >= 0.0) {
                return Err(ArgError::parse(line, format!("invalid time {t}")));
            }
            self.new_node(t / self.ne);
        }
        Ok(())
    }

    /// Rebuild the breakpoints from branch records. Nodes must have
    /// been read already.
    pub fn read_branches<R: BufRead>(&mut self, reader: R) -> Result<()> {
        let length = self.length_pos();
        let mut deleted = BTreeMap::<Position, BranchSet>::new();
        let mut inserted = BTreeMap::<Position, BranchSet>::new();
        deleted.insert(Position::ZERO, BranchSet::new());
        for record in records(reader, 4) {
            let (line, fields) = record?;
            let upper = self.node_from_index(parse(&fields[0], line)?, line)?;
            let lower = self.node_from_index(parse(&fields[1], line)?, line)?;
            let left = Position::new(parse(&fields[2], line)?);
            let right = Position::new(parse(&fields[3], line)?);
            if lower == NodeId::ROOT || right <= left {
                return Err(ArgError::parse(line, "invalid branch"));
            }
            let b = Branch::new(lower, upper);
            deleted.entry(right).or_default().insert(b);
            inserted.entry(left).or_default().insert(b);
        }
        deleted.remove(&length);
        let positions = deleted
            .keys()
            .chain(inserted.keys())
            .copied()
            .filter(|&pos| pos < length)
            .collect::<BTreeSet<_>>();
        for pos in positions {
            let r = Recombination::new(
                pos,
                deleted.remove(&pos).unwrap_or_default(),
                inserted.remove(&pos).unwrap_or_default(),
            );
            self.recombinations.insert(pos, r);
        }
        Ok(())
    }

    /// Attach sources and start times to the breakpoints read with
    /// [`Arg::read_branches`].
    pub fn read_recombinations<R: BufRead>(&mut self, reader: R) -> Result<()> {
        let mut sources = BTreeMap::new();
        for record in records(reader, 4) {
            let (line, fields) = record?;
            let pos = Position::new(parse(&fields[0], line)?);
            let lower = self.node_from_index(parse(&fields[1], line)?, line)?;
            let upper = self.node_from_index(parse(&fields[2], line)?, line)?;
            let t: f64 = parse(&fields[3], line)?;
            if !self.recombinations.contains_key(&pos) {
                return Err(ArgError::parse(line, format!("no breakpoint at {pos}")));
            }
            sources.insert(pos, (Branch::new(lower, upper), t / self.ne));
        }
        let length = self.length_pos();
        for (&pos, r) in self.recombinations.range_mut(..length) {
            if r.is_boundary() {
                continue;
            }
            let Some(&(source, t)) = sources.get(&pos) else {
                return Err(ArgError::MissingRecombination { pos });
            };
            r.set_source(source, t);
        }
        Ok(())
    }

    /// Read mapped branches and impute the states of every node
    /// from them.
    pub fn read_mutations<R: BufRead>(&mut self, reader: R) -> Result<()> {
        let length = self.length_pos();
        for record in records(reader, 4) {
            let (line, fields) = record?;
            let m = Position::new(parse(&fields[0], line)?);
            let lower = self.node_from_index(parse(&fields[1], line)?, line)?;
            let upper = self.node_from_index(parse(&fields[2], line)?, line)?;
            let state: u8 = parse(&fields[3], line)?;
            if m > length {
                continue;
            }
            self.mutation_sites.insert(m);
            if state == 1 {
                self.nodes.write_state(lower, m, 1);
                self.nodes.write_state(upper, m, 0);
            } else {
                self.nodes.write_state(upper, m, 1);
                self.nodes.write_state(lower, m, 0);
            }
            self.mutation_branches
                .entry(m)
                .or_default()
                .insert(Branch::new(lower, upper));
        }

        let mut tree = Tree::new();
        let mut events = self.recombinations.iter().peekable();
        while let Some((_, r)) = events.next_if(|&(&pos, _)| pos < length) {
            tree.forward_update(r);
            let next = events.peek().map_or(Position::END, |(&pos, _)| pos);
            for (&m, mapped) in self.mutation_branches.range(r.pos()..next) {
                tree.impute_states(&mut self.nodes, m, mapped);
            }
        }
        Ok(())
    }

    pub fn read_coordinates<R: BufRead>(&mut self, reader: R) -> Result<()> {
        self.coordinates.clear();
        for record in records(reader, 1) {
            let (line, fields) = record?;
            self.coordinates.push(parse(&fields[0], line)?);
        }
        Ok(())
    }

    /// Read a graph from its record files.
    pub fn read(ne: f64, sequence_length: f64, files: &ArgFiles) -> Result<Self> {
        let mut arg = Self::new(ne, sequence_length);
        arg.read_nodes(open_input(&files.nodes)?)?;
        arg.read_branches(open_input(&files.branches)?)?;
        if let Some(path) = &files.recombinations {
            arg.read_recombinations(open_input(path)?)?;
        }
        if let Some(path) = &files.mutations {
            arg.read_mutations(open_input(path)?)?;
        }
        arg.start_tree = arg.get_tree_at(Position::ZERO);
        info!(
            nodes = arg.nodes.len(),
            breakpoints = arg.recombinations.len(),
            sites = arg.mutation_sites.len() - 1,
            "read graph"
        );
        Ok(arg)
    }

    pub fn write(&self, files: &ArgFiles) -> Result<()> {
        self.write_nodes(create_output(&files.nodes)?)?;
        self.write_branches(create_output(&files.branches)?)?;
        if let Some(path) = &files.recombinations {
            self.write_recombinations(create_output(path)?)?;
        }
        if let Some(path) = &files.mutations {
            self.write_mutations(create_output(path)?)?;
        }
        info!(path = %files.nodes.display(), "wrote graph");
        Ok(())
    }
}
