//! Dependency linker: a reference graph over code units.
//!
//! Edges are undirected and come from three sources:
//! - **sequential**: consecutive units in the same file
//! - **nesting**: a unit whose line span contains another in the same file
//! - **cross-file**: a unit referencing a symbol declared by a unit in
//!   another file (matched through [`CodeUnit::references`] and
//!   [`CodeUnit::symbols`])
//!
//! [`DependencyGraph::expand`] walks the graph breadth-first from the diff
//! seeds and fills a [`ContextBundle`] under a token budget.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::models::{CodeUnit, ContextBundle, ContextSource};

/// Symbols declared by more units than this are too generic to link on.
const MAX_DECLARERS_PER_SYMBOL: usize = 8;

pub struct DependencyGraph {
    units: Vec<CodeUnit>,
    index: HashMap<String, usize>,
    adjacency: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Build the graph and fill every unit's `dependencies` with its neighbor ids.
    pub fn build(units: Vec<CodeUnit>) -> Self {
        let mut units = units;
        units.sort_by(|a, b| {
            a.file_path
                .cmp(&b.file_path)
                .then(a.start_line.cmp(&b.start_line))
                .then(a.end_line.cmp(&b.end_line))
                .then(a.id.cmp(&b.id))
        });
        units.dedup_by(|a, b| a.id == b.id);

        let index: HashMap<String, usize> = units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.id.clone(), i))
            .collect();
        let mut adjacency = vec![BTreeSet::new(); units.len()];
        let mut link = |a: usize, b: usize| {
            if a != b {
                adjacency[a].insert(b);
                adjacency[b].insert(a);
            }
        };

        // Same-file edges. Units are sorted by (file, start) so each file is a run.
        let mut file_start = 0;
        while file_start < units.len() {
            let path = &units[file_start].file_path;
            let file_end = units[file_start..]
                .iter()
                .position(|u| &u.file_path != path)
                .map_or(units.len(), |p| file_start + p);

            for i in file_start..file_end {
                if i + 1 < file_end {
                    link(i, i + 1);
                }
                for j in (i + 1)..file_end {
                    if units[j].start_line > units[i].end_line {
                        break;
                    }
                    let (outer, inner) = (&units[i], &units[j]);
                    if outer.start_line <= inner.start_line && inner.end_line <= outer.end_line {
                        link(i, j);
                    }
                }
            }
            file_start = file_end;
        }

        // Cross-file edges.
        let mut declarers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, unit) in units.iter().enumerate() {
            for symbol in &unit.symbols {
                declarers.entry(symbol.as_str()).or_default().push(i);
            }
        }
        for (i, unit) in units.iter().enumerate() {
            for reference in &unit.references {
                let Some(targets) = declarers.get(reference.as_str()) else {
                    continue;
                };
                if targets.len() > MAX_DECLARERS_PER_SYMBOL {
                    continue;
                }
                for &t in targets {
                    if units[t].file_path != unit.file_path {
                        link(i, t);
                    }
                }
            }
        }

        for (i, neighbors) in adjacency.iter().enumerate() {
            let mut deps: Vec<String> = neighbors.iter().map(|&n| units[n].id.clone()).collect();
            deps.sort();
            units[i].dependencies = deps;
        }

        tracing::debug!(
            units = units.len(),
            edges = adjacency.iter().map(BTreeSet::len).sum::<usize>() / 2,
            "dependency graph built"
        );

        Self {
            units,
            index,
            adjacency,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[CodeUnit] {
        &self.units
    }

    pub fn unit(&self, id: &str) -> Option<&CodeUnit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    pub fn neighbors(&self, id: &str) -> Vec<&CodeUnit> {
        self.index
            .get(id)
            .map(|&i| self.adjacency[i].iter().map(|&n| &self.units[n]).collect())
            .unwrap_or_default()
    }

    pub fn units_in_file(&self, path: &str) -> Vec<&CodeUnit> {
        self.units.iter().filter(|u| u.file_path == path).collect()
    }

    /// Units of `path` whose span intersects `[start, end]`.
    pub fn units_touching(&self, path: &str, start: usize, end: usize) -> Vec<&CodeUnit> {
        self.units
            .iter()
            .filter(|u| u.file_path == path && u.overlaps_lines(start, end))
            .collect()
    }

    /// Breadth-first expansion from `seeds` into a fresh bundle.
    pub fn expand(&self, seeds: &[String], hop_limit: usize, budget: usize) -> ContextBundle {
        let mut bundle = ContextBundle::new(budget);
        self.expand_into(&mut bundle, seeds, hop_limit);
        bundle
    }

    /// Breadth-first expansion from `seeds` into an existing bundle.
    ///
    /// Layer 0 is the seeds themselves (source `Diff`), layer `h` the units
    /// `h` edges away (source `Graph { hop: h }`). Within a layer candidates
    /// are ordered by relevance, then path, then start line. Candidates are
    /// added greedily; one that does not fit is skipped (and the bundle is
    /// flagged truncated) while smaller ones after it may still be added.
    pub fn expand_into(&self, bundle: &mut ContextBundle, seeds: &[String], hop_limit: usize) {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut layer: Vec<(usize, f64)> = Vec::new();
        for id in seeds {
            if let Some(&i) = self.index.get(id) {
                if visited.insert(i) {
                    layer.push((i, 1.0));
                }
            }
        }

        for hop in 0..=hop_limit {
            if layer.is_empty() {
                break;
            }
            layer.sort_by(|&(a, ra), &(b, rb)| {
                rb.partial_cmp(&ra)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| self.units[a].file_path.cmp(&self.units[b].file_path))
                    .then_with(|| self.units[a].start_line.cmp(&self.units[b].start_line))
            });

            for &(i, relevance) in &layer {
                let unit = &self.units[i];
                // Units of a file bundled whole still seed the traversal.
                if bundle.contains_unit(&unit.id) || bundle.files.iter().any(|f| f.path == unit.file_path) {
                    continue;
                }
                let source = if hop == 0 {
                    ContextSource::Diff
                } else {
                    ContextSource::Graph { hop }
                };
                let mut unit = unit.clone();
                unit.relevance = relevance;
                bundle.try_add_unit(unit, source);
            }

            if hop == hop_limit {
                break;
            }

            // Next layer: unvisited neighbors, scored by hop distance and by
            // how many frontier units link to them.
            let mut links: HashMap<usize, usize> = HashMap::new();
            for &(i, _) in &layer {
                for &n in &self.adjacency[i] {
                    if !visited.contains(&n) {
                        *links.entry(n).or_default() += 1;
                    }
                }
            }
            let max_links = links.values().copied().max().unwrap_or(1) as f64;
            let base = 1.0 / (hop + 2) as f64;
            layer = links
                .into_iter()
                .map(|(n, count)| (n, base * (0.5 + 0.5 * count as f64 / max_links)))
                .collect();
            for &(n, _) in &layer {
                visited.insert(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{content_hash, UnitKind};

    fn unit(path: &str, start: usize, end: usize, tokens: usize, symbols: &[&str], refs: &[&str]) -> CodeUnit {
        let text = format!("{path}:{start}");
        CodeUnit {
            id: CodeUnit::make_id("r", path, start, end, 0),
            repository: "r".into(),
            file_path: path.into(),
            start_line: start,
            end_line: end,
            kind: UnitKind::Function,
            language: "rust".into(),
            hash: content_hash(&text),
            text,
            token_count: tokens,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            references: refs.iter().map(|s| s.to_string()).collect(),
            relevance: 0.0,
            dependencies: vec![],
        }
    }

    fn sample() -> DependencyGraph {
        DependencyGraph::build(vec![
            unit("a.rs", 1, 10, 100, &["handler"], &["parse_config"]),
            unit("a.rs", 11, 20, 100, &["helper"], &[]),
            unit("b.rs", 1, 30, 100, &["parse_config"], &["Settings"]),
            unit("c.rs", 1, 5, 100, &["Settings"], &[]),
            unit("d.rs", 1, 5, 100, &["unrelated"], &[]),
        ])
    }

    fn id(path: &str, start: usize, end: usize) -> String {
        CodeUnit::make_id("r", path, start, end, 0)
    }

    #[test]
    fn test_edges() {
        let g = sample();
        let a1 = id("a.rs", 1, 10);
        let neighbors: Vec<&str> = g.neighbors(&a1).iter().map(|u| u.file_path.as_str()).collect();
        assert!(neighbors.contains(&"a.rs"));
        assert!(neighbors.contains(&"b.rs"));
        assert!(!neighbors.contains(&"c.rs"));
        assert!(g.neighbors(&id("d.rs", 1, 5)).is_empty());
        assert_eq!(g.unit(&a1).unwrap().dependencies.len(), 2);
    }

    #[test]
    fn test_nesting_links() {
        let g = DependencyGraph::build(vec![
            unit("x.rs", 1, 50, 10, &[], &[]),
            unit("x.rs", 60, 70, 10, &[], &[]),
            unit("x.rs", 5, 20, 10, &[], &[]),
        ]);
        let outer = id("x.rs", 1, 50);
        let inner = id("x.rs", 5, 20);
        assert!(g.neighbors(&outer).iter().any(|u| u.id == inner));
    }

    #[test]
    fn test_expand_orders_by_hop() {
        let g = sample();
        let bundle = g.expand(&[id("a.rs", 1, 10)], 2, 10_000);
        let sources: Vec<(String, ContextSource)> = bundle
            .units
            .iter()
            .map(|b| (b.unit.file_path.clone(), b.source))
            .collect();
        assert_eq!(sources[0], ("a.rs".to_string(), ContextSource::Diff));
        assert!(sources.contains(&("b.rs".to_string(), ContextSource::Graph { hop: 1 })));
        assert!(sources.contains(&("c.rs".to_string(), ContextSource::Graph { hop: 2 })));
        assert!(!sources.iter().any(|(p, _)| p == "d.rs"));
        assert!(!bundle.truncated);
    }

    #[test]
    fn test_expand_respects_hop_limit() {
        let g = sample();
        let bundle = g.expand(&[id("a.rs", 1, 10)], 1, 10_000);
        assert!(!bundle.units.iter().any(|b| b.unit.file_path == "c.rs"));
    }

    #[test]
    fn test_expand_truncates_with_reason() {
        let g = sample();
        let bundle = g.expand(&[id("a.rs", 1, 10)], 2, 250);
        assert!(bundle.total_tokens <= 250);
        assert!(bundle.truncated);
        assert!(!bundle.truncation_reason.as_deref().unwrap_or("").is_empty());
        assert_eq!(bundle.units.len(), 2);
    }
}
