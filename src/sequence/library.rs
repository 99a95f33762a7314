//! Saved sequences and sub-sequence inlining.
//!
//! A saved sequence is a `<name>.yaml` document in the library directory. Two
//! layouts are accepted: a plain list of rows, or a mapping whose `command`
//! key holds the rows and whose optional `address` key maps instrument ids to
//! connection addresses (used by safe-exit sequences that need their own
//! connections).

use super::loader::{self, file_label, DocumentRow, Row, SequenceSource};
use super::{Sequence, Step};
use crate::config::Address;
use crate::error::{BenchError, BenchResult, ValidationError, Violation, ViolationKind};
use crate::instrument::CapabilityRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File extension of saved sequences.
pub const EXTENSION: &str = "yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Document {
    Full {
        command: Vec<DocumentRow>,
        #[serde(default)]
        address: BTreeMap<String, Address>,
    },
    Rows(Vec<DocumentRow>),
}

/// Parsed contents of a saved sequence document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedSequence {
    /// Rows in order.
    pub rows: Vec<Row>,
    /// Instrument id (lower-cased) → address override.
    pub address: BTreeMap<String, Address>,
}

impl SavedSequence {
    /// Read and parse the document at `path`.
    pub fn read(path: &Path) -> BenchResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| BenchError::Source {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&text)
    }

    /// Parse either document layout.
    pub fn parse(text: &str) -> BenchResult<Self> {
        let (rows, address) = match serde_yaml::from_str::<Document>(text)? {
            Document::Full { command, address } => (command, address),
            Document::Rows(rows) => (rows, BTreeMap::new()),
        };
        Ok(Self {
            rows: rows.into_iter().map(Row::from).collect(),
            address: address
                .into_iter()
                .map(|(id, addr)| (id.to_lowercase(), addr))
                .collect(),
        })
    }
}

/// A YAML saved-sequence file used directly as a source.
pub struct YamlSource {
    path: PathBuf,
}

impl YamlSource {
    /// Source reading the document at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SequenceSource for YamlSource {
    fn label(&self) -> String {
        file_label(&self.path)
    }

    fn rows(&self) -> BenchResult<Vec<Row>> {
        Ok(SavedSequence::read(&self.path)?.rows)
    }
}

/// Directory of saved sequences.
#[derive(Debug, Clone)]
pub struct SequenceLibrary {
    dir: PathBuf,
}

impl SequenceLibrary {
    /// Library rooted at `dir`. The directory need not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Library directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a sequence called `name` lives in.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name.trim(), EXTENSION))
    }

    /// True if a saved sequence called `name` exists.
    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    /// Names of every saved sequence, sorted.
    pub fn list(&self) -> BenchResult<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Parse the saved sequence `name`.
    pub fn read(&self, name: &str) -> BenchResult<SavedSequence> {
        SavedSequence::read(&self.path_for(name))
    }

    /// Load a saved sequence without inlining its own references.
    pub fn load(&self, name: &str, registry: &CapabilityRegistry) -> BenchResult<Sequence> {
        let saved = self.read(name)?;
        let label = file_label(&self.path_for(name));
        Ok(loader::load(&label, &saved.rows, registry)?)
    }

    /// Write a sequence as a plain row list, replacing any existing file.
    pub fn save(&self, name: &str, seq: &Sequence) -> BenchResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let rows: Vec<DocumentRow> = seq.iter().map(DocumentRow::from).collect();
        let path = self.path_for(name);
        fs::write(&path, serde_yaml::to_string(&rows)?)?;
        info!("Saved {} steps to {}", rows.len(), path.display());
        Ok(path)
    }

    /// Inline every `sequence` step, recursively.
    ///
    /// Missing saved sequences are reported together as one validation error;
    /// a reference chain that revisits a sequence fails as cyclic.
    pub fn expand_subsequences(
        &self,
        seq: &Sequence,
        registry: &CapabilityRegistry,
    ) -> BenchResult<Sequence> {
        let mut chain = vec![seq.name.clone()];
        let steps = self.expand_steps(seq, registry, &mut chain)?;
        Ok(Sequence::new(seq.name.clone(), steps))
    }

    fn expand_steps(
        &self,
        seq: &Sequence,
        registry: &CapabilityRegistry,
        chain: &mut Vec<String>,
    ) -> BenchResult<Vec<Step>> {
        self.check_references(seq)?;

        let mut steps = Vec::with_capacity(seq.len());
        for step in seq {
            if !step.is_sequence_ref() {
                steps.push(step.clone());
                continue;
            }

            let name = step.command.as_str();
            if chain.iter().any(|seen| seen == name) {
                let mut cycle = chain.clone();
                cycle.push(name.to_string());
                return Err(BenchError::CyclicSequence { chain: cycle });
            }

            let sub = self.load(name, registry)?;
            debug!("Inlining {} ({} steps) at {}", name, sub.len(), step.origin);
            chain.push(name.to_string());
            steps.extend(self.expand_steps(&sub, registry, chain)?);
            chain.pop();
        }
        Ok(steps)
    }

    fn check_references(&self, seq: &Sequence) -> Result<(), ValidationError> {
        let missing: Vec<Violation> = seq
            .iter()
            .filter(|s| s.is_sequence_ref() && !self.exists(&s.command))
            .map(|s| Violation {
                at: s.origin.clone(),
                detail: format!("sequence '{}'", s.command),
            })
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(ViolationKind::Sequence, missing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::step;
    use tempfile::TempDir;

    fn library_with(files: &[(&str, &str)]) -> (TempDir, SequenceLibrary) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            fs::write(dir.path().join(format!("{}.yaml", name)), body).unwrap();
        }
        let library = SequenceLibrary::new(dir.path());
        (dir, library)
    }

    const WARMUP: &str = r#"
- {Time: 0, Instrument: dc_source, Command: set_function, Argument: "-"}
- {Time: 2, Instrument: dc_source, Command: set_output, Argument: "on"}
"#;

    #[test]
    fn test_both_document_layouts_parse() {
        let plain = SavedSequence::parse(WARMUP).unwrap();
        assert_eq!(plain.rows.len(), 2);
        assert!(plain.address.is_empty());

        let full = SavedSequence::parse(
            r#"
command:
  - {Time: 0, Instrument: powersupply, Command: set_output, Argument: 0}
address:
  PowerSupply: "GPIB0::5::INSTR"
"#,
        )
        .unwrap();
        assert_eq!(full.rows[0].argument.as_deref(), Some("0"));
        assert_eq!(
            full.address.get("powersupply"),
            Some(&Address::Resource("GPIB0::5::INSTR".into()))
        );
    }

    #[test]
    fn test_subsequence_at_start_is_spliced() {
        let (_dir, library) = library_with(&[("warmup", WARMUP)]);
        let registry = CapabilityRegistry::standard();
        let seq = Sequence::new(
            "command.csv",
            vec![
                step(0.0, "sequence", "warmup", "-"),
                step(5.0, "ac_source", "europe_grid", "-"),
            ],
        );
        let expanded = library.expand_subsequences(&seq, &registry).unwrap();
        let commands: Vec<_> = expanded.iter().map(|s| s.command.as_str()).collect();
        assert_eq!(commands, vec!["set_function", "set_output", "europe_grid"]);
        assert_eq!(expanded.steps[1].origin.source, "warmup.yaml");
        assert_eq!(expanded.steps[1].origin.row, 3);
    }

    #[test]
    fn test_subsequence_in_middle_and_end() {
        let (_dir, library) = library_with(&[("warmup", WARMUP)]);
        let registry = CapabilityRegistry::standard();
        let seq = Sequence::new(
            "command.csv",
            vec![
                step(0.0, "ac_source", "usa_grid", "-"),
                step(0.0, "sequence", "warmup", "-"),
                step(0.0, "ac_source", "europe_grid", "-"),
                step(0.0, "sequence", "warmup", "-"),
            ],
        );
        let expanded = library.expand_subsequences(&seq, &registry).unwrap();
        let commands: Vec<_> = expanded.iter().map(|s| s.command.as_str()).collect();
        assert_eq!(
            commands,
            vec![
                "usa_grid",
                "set_function",
                "set_output",
                "europe_grid",
                "set_function",
                "set_output"
            ]
        );
    }

    #[test]
    fn test_missing_subsequences_are_batched() {
        let (_dir, library) = library_with(&[("warmup", WARMUP)]);
        let registry = CapabilityRegistry::standard();
        let mut seq = Sequence::new(
            "command.csv",
            vec![
                step(0.0, "sequence", "nope", "-"),
                step(0.0, "sequence", "warmup", "-"),
                step(0.0, "sequence", "gone", "-"),
            ],
        );
        for (i, s) in seq.steps.iter_mut().enumerate() {
            s.origin.row = i + 2;
        }
        match library.expand_subsequences(&seq, &registry) {
            Err(BenchError::Validation(err)) => {
                assert_eq!(err.kind, ViolationKind::Sequence);
                assert_eq!(err.rows(), vec![2, 4]);
            }
            other => panic!("expected validation error, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_cycle_is_detected() {
        let (_dir, library) = library_with(&[
            ("a", "- {Time: 0, Instrument: sequence, Command: b, Argument: '-'}\n"),
            ("b", "- {Time: 0, Instrument: sequence, Command: a, Argument: '-'}\n"),
        ]);
        let registry = CapabilityRegistry::standard();
        let seq = Sequence::new("command.csv", vec![step(0.0, "sequence", "a", "-")]);
        match library.expand_subsequences(&seq, &registry) {
            Err(BenchError::CyclicSequence { chain }) => {
                assert_eq!(chain, vec!["command.csv", "a", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_save_then_list() {
        let (_dir, library) = library_with(&[]);
        let registry = CapabilityRegistry::standard();
        let seq = Sequence::new(
            "command.csv",
            vec![
                step(0.0, "dc_source", "set_output", "on"),
                step(1.5, "clim_chamber", "write_setpoint", "Temp 25 10"),
            ],
        );
        library.save("bench", &seq).unwrap();
        assert_eq!(library.list().unwrap(), vec!["bench"]);

        let loaded = library.load("bench", &registry).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.steps[1].relative_time, 1.5);
        assert_eq!(
            loaded.steps[1].argument_text.as_deref(),
            Some("Temp 25 10")
        );
    }
}
