//! Random account material: usernames, display names and passwords

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{CloudMailError, Result};

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"!@#$%^&*";
const SIMPLE_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()_+";

const ADJECTIVES: &[&str] = &[
    "swift", "smart", "cyber", "digital", "quantum", "binary", "crypto", "tech", "pixel", "data",
    "neural", "cloud", "mobile", "robot", "atomic", "vector", "matrix", "laser", "sonic", "nano",
    "clever", "bright", "quick", "wise", "sharp", "keen", "agile", "rapid", "fast", "skilled",
    "talent", "genius", "expert", "gifted", "capable", "adept", "savvy", "apt", "able", "happy",
    "cool", "epic", "super", "mega", "ultra", "hyper", "prime", "elite", "pro",
];

const NOUNS: &[&str] = &[
    "coder", "dev", "hacker", "ninja", "wizard", "guru", "master", "pro", "expert", "ace",
    "programmer", "developer", "analyst", "designer", "admin", "architect", "engineer", "techie",
    "geek", "nerd", "tech", "byte", "bit", "data", "code", "algo", "sys", "net", "web", "app",
    "cloud", "cyber", "crypto", "quantum", "mobile", "robot", "ai", "ml", "db", "api",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Word,
    Number,
}

use Part::{Number, Word};

const THREE_PART_PATTERNS: &[&[Part]] = &[
    &[Word, Number, Word],
    &[Word, Number, Number],
    &[Word, Word, Number],
];

const FOUR_PART_PATTERNS: &[&[Part]] = &[
    &[Word, Number, Word, Number],
    &[Word, Word, Word, Number],
    &[Word, Number, Word, Word],
    &[Word, Word, Number, Word],
];

/// Password over `a-zA-Z0-9!@#$%^&*()_+` with no class guarantees
pub fn random_password(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| SIMPLE_CHARSET[rng.gen_range(0..SIMPLE_CHARSET.len())] as char)
        .collect()
}

/// Freshly generated identity for a disposable address
#[derive(Debug, Clone)]
pub struct GeneratedAccount {
    pub username: String,
    pub domain: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone)]
pub struct AccountGenerator {
    password_length: usize,
}

impl Default for AccountGenerator {
    fn default() -> Self {
        Self { password_length: 15 }
    }
}

impl AccountGenerator {
    pub fn new(password_length: usize) -> Self {
        Self {
            password_length: password_length.max(4),
        }
    }

    /// Password with at least one lowercase, uppercase, digit and special character.
    pub fn password(&self) -> String {
        let mut rng = rand::thread_rng();
        let classes = [LOWERCASE, UPPERCASE, DIGITS, SPECIAL];
        let pool: Vec<u8> = classes.concat();

        let mut chars: Vec<u8> = classes
            .iter()
            .map(|set| set[rng.gen_range(0..set.len())])
            .collect();
        while chars.len() < self.password_length {
            chars.push(pool[rng.gen_range(0..pool.len())]);
        }
        chars.shuffle(&mut rng);

        chars.into_iter().map(char::from).collect()
    }

    /// Three or four words and numbers glued together, e.g. `swift42coder`
    pub fn username(&self) -> String {
        let mut rng = rand::thread_rng();
        let patterns = if rng.gen_bool(0.5) {
            THREE_PART_PATTERNS
        } else {
            FOUR_PART_PATTERNS
        };
        let pattern = patterns.choose(&mut rng).copied().unwrap_or(&[Word, Number]);

        pattern
            .iter()
            .map(|part| match part {
                Number => rng.gen_range(0..9999).to_string(),
                Word => {
                    let words = if rng.gen_bool(0.5) { ADJECTIVES } else { NOUNS };
                    words.choose(&mut rng).copied().unwrap_or("user").to_string()
                }
            })
            .collect()
    }

    pub fn first_name(&self) -> String {
        let mut rng = rand::thread_rng();
        capitalize(ADJECTIVES.choose(&mut rng).copied().unwrap_or("swift"))
    }

    pub fn last_name(&self) -> String {
        let mut rng = rand::thread_rng();
        capitalize(NOUNS.choose(&mut rng).copied().unwrap_or("coder"))
    }

    /// Complete identity on one of `domains`, chosen at random.
    pub fn generate(&self, domains: &[String]) -> Result<GeneratedAccount> {
        let domain = domains
            .choose(&mut rand::thread_rng())
            .map(|d| d.trim_start_matches('@').to_lowercase())
            .ok_or_else(|| CloudMailError::Config("no Cloudflare domain configured".to_string()))?;

        let username = self.username();
        Ok(GeneratedAccount {
            email: format!("{}@{}", username, domain),
            username,
            domain,
            password: self.password(),
            first_name: self.first_name(),
            last_name: self.last_name(),
        })
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
