//! Scanner properties
//!
//! The scanner must never panic, never report a target twice, and never
//! report a partial match out of a malformed embed.

use notesafe_scanner::ImageReferenceScanner;
use proptest::prelude::*;
use std::collections::HashSet;

proptest! {
    #[test]
    fn scan_never_panics(text in "\\PC*") {
        let _ = ImageReferenceScanner::new().scan(&text);
    }

    #[test]
    fn scan_results_are_unique_and_ordered(
        names in prop::collection::vec("[a-z]{1,8}", 0..12),
        wiki in prop::collection::vec(any::<bool>(), 12),
    ) {
        let mut note = String::new();
        for (i, name) in names.iter().enumerate() {
            if wiki[i] {
                note.push_str(&format!("![[{name}.png]]\n"));
            } else {
                note.push_str(&format!("![{name}]({name}.png)\n"));
            }
        }

        let embeds = ImageReferenceScanner::new().scan(&note);
        let mut seen = HashSet::new();
        for embed in &embeds {
            prop_assert!(seen.insert(embed.target.clone()));
        }
        prop_assert!(embeds.windows(2).all(|w| w[0].offset < w[1].offset));

        let distinct: HashSet<_> = names.iter().map(|n| format!("{n}.png")).collect();
        prop_assert_eq!(embeds.len(), distinct.len());
    }

    #[test]
    fn truncated_embeds_never_match(name in "[a-z]{1,8}", cut in 1usize..14) {
        let full = format!("![[{name}.png]]");
        let truncated: String = full.chars().take(full.len().saturating_sub(cut).max(1)).collect();
        prop_assume!(truncated != full);
        prop_assert!(ImageReferenceScanner::new().scan(&truncated).is_empty());
    }
}
