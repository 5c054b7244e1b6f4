//! File-based replay harness.
//!
//! Case files hold newline-delimited commands (`INSERT k`, `DELETE k`,
//! `GET k`). Each file is replayed against every engine through the public
//! [`TreeIndex`] contract, with GET answers compared against a `BTreeSet`
//! oracle fed the same stream.

use grove::{CoarseTree, FineTree, PalmTree, TreeIndex};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
enum Command {
    Insert(i64),
    Delete(i64),
    Get(i64),
}

fn parse_case(path: &Path) -> Vec<Command> {
    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read case file {}: {err}", path.display()));
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut parts = line.split_whitespace();
            let verb = parts.next().expect("command verb");
            let key: i64 = parts
                .next()
                .expect("command key")
                .parse()
                .expect("numeric key");
            match verb {
                "INSERT" => Command::Insert(key),
                "DELETE" => Command::Delete(key),
                "GET" => Command::Get(key),
                other => panic!("unknown command {other:?} in {}", path.display()),
            }
        })
        .collect()
}

fn replay(tree: &dyn TreeIndex<i64>, commands: &[Command], label: &str) {
    let mut oracle = BTreeSet::new();
    for (line, command) in commands.iter().enumerate() {
        match *command {
            Command::Insert(key) => {
                tree.insert(key);
                oracle.insert(key);
            }
            Command::Delete(key) => {
                assert_eq!(
                    tree.remove(&key),
                    oracle.remove(&key),
                    "{label}: DELETE {key} at line {line} disagrees with oracle"
                );
            }
            Command::Get(key) => {
                assert_eq!(
                    tree.get(&key),
                    oracle.get(&key).copied(),
                    "{label}: GET {key} at line {line} disagrees with oracle"
                );
            }
        }
    }
    assert_eq!(tree.size(), oracle.len(), "{label}: final size disagrees");
}

fn replay_case(name: &str) {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/cases")
        .join(name);
    let commands = parse_case(&path);

    replay(&FineTree::new(3), &commands, &format!("fine/{name}"));
    replay(&FineTree::new(8), &commands, &format!("fine8/{name}"));
    replay(&CoarseTree::new(3), &commands, &format!("coarse/{name}"));
    replay(
        &PalmTree::with_batch_size(3, 2, 8),
        &commands,
        &format!("palm/{name}"),
    );
}

#[test]
fn replay_small_0() {
    replay_case("small_0.case");
}

#[test]
fn replay_small_1() {
    replay_case("small_1.case");
}

#[test]
fn replay_small_2() {
    replay_case("small_2.case");
}
