//! Pluggable tokenizers
//!
//! Standard whitespace/punctuation splitting, character n-grams, English
//! with light suffix stemming, and CJK-aware bigrams. All tokenizers
//! lowercase their output.

/// A tokenizer turns text into a stream of terms.
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &'static str;
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Split on anything that is not alphanumeric, lowercase.
#[derive(Debug, Default)]
pub struct StandardTokenizer;

impl Tokenizer for StandardTokenizer {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }
}

/// Character n-grams over each standard token.
#[derive(Debug)]
pub struct NgramTokenizer {
    pub n: usize,
}

impl Default for NgramTokenizer {
    fn default() -> Self {
        Self { n: 2 }
    }
}

impl Tokenizer for NgramTokenizer {
    fn name(&self) -> &'static str {
        "ngram"
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for token in StandardTokenizer.tokenize(text) {
            let chars: Vec<char> = token.chars().collect();
            if chars.len() <= self.n {
                out.push(token);
                continue;
            }
            for window in chars.windows(self.n) {
                out.push(window.iter().collect());
            }
        }
        out
    }
}

/// English tokenizer: standard splitting, stop-word removal, and a light
/// suffix stemmer in the Porter style.
#[derive(Debug, Default)]
pub struct EnglishTokenizer;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is",
    "it", "its", "of", "on", "that", "the", "to", "was", "were", "will", "with",
];

fn stem(token: &str) -> String {
    let t = token;
    for (suffix, replacement) in [
        ("sses", "ss"),
        ("ies", "i"),
        ("ational", "ate"),
        ("tional", "tion"),
        ("ment", ""),
        ("ness", ""),
        ("ing", ""),
        ("edly", ""),
        ("ed", ""),
        ("ly", ""),
        ("s", ""),
    ] {
        if let Some(stripped) = t.strip_suffix(suffix) {
            // Keep short stems intact so "was" does not become "wa".
            if stripped.len() >= 3 {
                return format!("{stripped}{replacement}");
            }
        }
    }
    t.to_string()
}

impl Tokenizer for EnglishTokenizer {
    fn name(&self) -> &'static str {
        "english"
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        StandardTokenizer
            .tokenize(text)
            .into_iter()
            .filter(|t| !STOP_WORDS.contains(&t.as_str()))
            .map(|t| stem(&t))
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// CJK-aware tokenizer: runs of CJK code points emit overlapping bigrams,
/// everything else goes through the standard tokenizer.
#[derive(Debug, Default)]
pub struct CjkTokenizer;

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}'
    )
}

impl Tokenizer for CjkTokenizer {
    fn name(&self) -> &'static str {
        "cjk"
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut run: Vec<char> = Vec::new();
        let mut other = String::new();

        let mut flush_run = |run: &mut Vec<char>, out: &mut Vec<String>| {
            match run.len() {
                0 => {}
                1 => out.push(run[0].to_string()),
                _ => {
                    for pair in run.windows(2) {
                        out.push(pair.iter().collect());
                    }
                }
            }
            run.clear();
        };

        for c in text.chars() {
            if is_cjk(c) {
                if !other.is_empty() {
                    out.extend(StandardTokenizer.tokenize(&other));
                    other.clear();
                }
                run.push(c);
            } else {
                flush_run(&mut run, &mut out);
                other.push(c);
            }
        }
        flush_run(&mut run, &mut out);
        if !other.is_empty() {
            out.extend(StandardTokenizer.tokenize(&other));
        }
        out
    }
}

/// Resolve a tokenizer by configuration name.
pub fn by_name(name: &str) -> Box<dyn Tokenizer> {
    match name {
        "ngram" => Box::new(NgramTokenizer::default()),
        "english" => Box::new(EnglishTokenizer),
        "cjk" => Box::new(CjkTokenizer),
        _ => Box::new(StandardTokenizer),
    }
}
