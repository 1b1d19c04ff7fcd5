use proptest::prelude::*;
use sshlure::config::types::{CommandConfig, MatchMode};
use sshlure::shell::parser::{is_word_prefix, tokenize};
use sshlure::shell::terminal::{LineEditor, LineEvent};
use sshlure::shell::CommandTable;

fn word() -> impl Strategy<Value = String> {
    "[a-z0-9/._-]{1,8}"
}

fn command_line() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(word(), 1..6)
}

fn entry(prefix: &str) -> CommandConfig {
    CommandConfig {
        prefix: prefix.to_string(),
        stdout: format!("{prefix}\n"),
        ..CommandConfig::default()
    }
}

proptest! {
    #[test]
    fn tokenize_never_panics(input in "\\PC{0,200}") {
        let _ = tokenize(&input);
    }

    #[test]
    fn tokenize_plain_words_round_trip(words in command_line()) {
        let line = words.join(" ");
        prop_assert_eq!(tokenize(&line), words);
    }

    /// Whatever the longest-prefix table picks is a word prefix of the line and
    /// no other matching entry has more words.
    #[test]
    fn longest_prefix_contract(
        line in command_line(),
        prefixes in prop::collection::vec(command_line(), 0..8),
        take in prop::collection::vec(1usize..6, 0..4),
    ) {
        // Mix random prefixes with real prefixes of the line so matches happen.
        let mut entries: Vec<String> = prefixes.iter().map(|p| p.join(" ")).collect();
        for n in take {
            let n = n.min(line.len());
            entries.push(line[..n].join(" "));
        }
        let commands: Vec<CommandConfig> = entries.iter().map(|p| entry(p)).collect();
        let table = CommandTable::new(MatchMode::LongestPrefix, &commands);

        let words = line.clone();
        let text = line.join(" ");
        let best_len = entries
            .iter()
            .map(|e| tokenize(e))
            .filter(|e| is_word_prefix(e, &words))
            .map(|e| e.len())
            .max();

        match table.lookup(&text) {
            None => prop_assert!(best_len.is_none()),
            Some(found) => {
                let found_words = tokenize(&found.prefix);
                prop_assert!(is_word_prefix(&found_words, &words));
                prop_assert_eq!(Some(found_words.len()), best_len);
            }
        }
    }

    /// Exact mode matches only entries equal to the whole line.
    #[test]
    fn exact_mode_contract(line in command_line(), extra in word()) {
        let text = line.join(" ");
        let table = CommandTable::new(MatchMode::Exact, &[entry(&text)]);
        prop_assert!(table.lookup(&text).is_some());
        let longer = format!("{text} {extra}");
        prop_assert!(table.lookup(&longer).is_none());
    }

    /// Feeding input in arbitrary chunks yields the same lines as feeding it whole.
    #[test]
    fn line_editor_chunking_invariant(
        lines in prop::collection::vec("[a-z ]{0,20}", 1..5),
        split in 0usize..100,
    ) {
        let input: String = lines.iter().map(|l| format!("{l}\n")).collect();
        let bytes = input.as_bytes();
        let split = split.min(bytes.len());

        let mut whole = LineEditor::new(false, 4096);
        let (_, expected) = whole.feed(bytes);

        let mut chunked = LineEditor::new(false, 4096);
        let (_, mut got) = chunked.feed(&bytes[..split]);
        let (_, rest) = chunked.feed(&bytes[split..]);
        got.extend(rest);

        prop_assert_eq!(&got, &expected);
        let want: Vec<LineEvent> = lines.into_iter().map(LineEvent::Line).collect();
        prop_assert_eq!(got, want);
    }
}
