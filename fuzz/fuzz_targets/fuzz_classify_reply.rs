#![no_main]

//! Fuzz target for approval reply classification and post splitting.
//!
//! Replies are arbitrary human text, so classification must never panic and
//! must not depend on anything but the text itself.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use mmrelay::approval::classify_text;
use mmrelay::gateway::{split_for_posts, MAX_POST_CHARS};
use mmrelay::models::Verdict;

#[derive(Arbitrary, Debug)]
struct ReplyInput {
    text: String,
    /// Padding appended around the text
    padding: u8,
}

fuzz_target!(|input: ReplyInput| {
    let verdict = classify_text(&input.text);
    assert_eq!(verdict, classify_text(&input.text));

    // Surrounding whitespace never changes the outcome
    let padded = format!(
        "{}{}{}",
        " ".repeat(input.padding as usize % 8),
        input.text,
        "\n".repeat(input.padding as usize % 3)
    );
    assert_eq!(verdict, classify_text(&padded));

    if let Some(verdict) = verdict {
        assert_eq!(verdict.as_str().parse::<Verdict>().ok(), Some(verdict));
    }
    let _ = input.text.parse::<Verdict>();

    let parts = split_for_posts(&input.text);
    assert!(!parts.is_empty());
    assert!(parts.iter().all(|part| part.chars().count() <= MAX_POST_CHARS));
    assert_eq!(parts.concat(), input.text);
});
