// SPDX-License-Identifier: MIT

//! ATerm-style serialization of derivations.
//!
//! The canonical form is
//!
//! ```text
//! Derive([(outputs)],[(input_drvs)],[input_srcs],"system","builder",[args],[env])
//! ```
//!
//! Output tuples are `("name","path","methodAlgo","digestHex")`:
//! input-addressed outputs serialize all three trailing fields empty,
//! floating CA outputs carry only the method/algo, fixed CA outputs carry
//! method/algo and the pinned digest in hex. Parsing and serialization
//! are exact inverses.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::content_address::{CaMethod, ContentAddress};
use crate::derivation::{Derivation, OutputSpec};
use crate::hash::{Hash, HashAlgo, ParseHashError};
use crate::store_path::{StoreDir, StorePathError};

#[derive(Debug, Error)]
pub enum ParseDrvError {
    #[error("unexpected end of input at position {0}")]
    UnexpectedEof(usize),
    #[error("at position {pos}: expected {expected}, got {got:?}")]
    Expected {
        pos: usize,
        expected: String,
        got: String,
    },
    #[error("derivation is not valid UTF-8")]
    NotUtf8,
    #[error("invalid store path: {0}")]
    InvalidStorePath(#[from] StorePathError),
    #[error("invalid output hash: {0}")]
    InvalidHash(#[from] ParseHashError),
    #[error("invalid output method/algo {0:?}")]
    InvalidMethodAlgo(String),
    #[error("output {0:?} pins a digest but no method/algo")]
    DigestWithoutMethod(String),
    #[error("trailing bytes after derivation")]
    TrailingInput,
}

/// The method/algo column of an output tuple: `sha256`, `r:sha256`, or
/// `text:sha256`.
fn method_algo_string(method: CaMethod, algo: HashAlgo) -> String {
    match method {
        CaMethod::Flat => algo.to_string(),
        CaMethod::Recursive => format!("r:{algo}"),
        CaMethod::Text => format!("text:{algo}"),
    }
}

fn parse_method_algo(s: &str) -> Result<(CaMethod, HashAlgo), ParseDrvError> {
    let (method, algo_s) = if let Some(rest) = s.strip_prefix("r:") {
        (CaMethod::Recursive, rest)
    } else if let Some(rest) = s.strip_prefix("text:") {
        (CaMethod::Text, rest)
    } else {
        (CaMethod::Flat, s)
    };
    let algo: HashAlgo = algo_s
        .parse()
        .map_err(|_| ParseDrvError::InvalidMethodAlgo(s.to_string()))?;
    Ok((method, algo))
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

fn escape_into(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_list<T>(out: &mut String, items: impl IntoIterator<Item = T>, mut f: impl FnMut(&mut String, T)) {
    out.push('[');
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        f(out, item);
    }
    out.push(']');
}

pub(super) fn marshal(drv: &Derivation, store_dir: &StoreDir) -> Vec<u8> {
    let mut s = String::with_capacity(4096);
    s.push_str("Derive(");

    // Outputs
    write_list(&mut s, drv.outputs.iter(), |s, (name, output)| {
        let (path, method_algo, digest) = match output {
            OutputSpec::InputAddressed => (String::new(), String::new(), String::new()),
            OutputSpec::CaFixed(ca) => {
                // The fixed path is a pure function of the pin; embed it
                // so builders can read their own output location.
                let path = crate::content_address::fixed_ca_output_path(
                    store_dir,
                    &crate::content_address::output_path_name(&drv.name, name),
                    ca,
                    &Default::default(),
                )
                .map(|p| store_dir.display_path(&p))
                .unwrap_or_default();
                (
                    path,
                    method_algo_string(ca.method(), ca.hash().algo),
                    ca.hash().to_hex(),
                )
            }
            OutputSpec::CaFloating { method, algo } => {
                (String::new(), method_algo_string(*method, *algo), String::new())
            }
        };
        s.push('(');
        escape_into(s, name);
        s.push(',');
        escape_into(s, &path);
        s.push(',');
        escape_into(s, &method_algo);
        s.push(',');
        escape_into(s, &digest);
        s.push(')');
    });
    s.push(',');

    // Input derivations
    write_list(&mut s, drv.input_derivations.iter(), |s, (path, outputs)| {
        s.push('(');
        escape_into(s, &store_dir.display_path(path));
        s.push(',');
        write_list(s, outputs.iter(), |s, o| escape_into(s, o));
        s.push(')');
    });
    s.push(',');

    // Input sources
    write_list(&mut s, drv.input_sources.iter(), |s, p| {
        escape_into(s, &store_dir.display_path(p))
    });
    s.push(',');

    escape_into(&mut s, &drv.system);
    s.push(',');
    escape_into(&mut s, &drv.builder);
    s.push(',');

    write_list(&mut s, drv.args.iter(), |s, a| escape_into(s, a));
    s.push(',');

    write_list(&mut s, drv.env.iter(), |s, (k, v)| {
        s.push('(');
        escape_into(s, k);
        s.push(',');
        escape_into(s, v);
        s.push(')');
    });

    s.push(')');
    s.into_bytes()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Parser { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect_char(&mut self, c: char) -> Result<(), ParseDrvError> {
        match self.peek() {
            Some(got) if got == c => {
                self.pos += got.len_utf8();
                Ok(())
            }
            Some(got) => Err(ParseDrvError::Expected {
                pos: self.pos,
                expected: format!("{c:?}"),
                got: got.to_string(),
            }),
            None => Err(ParseDrvError::UnexpectedEof(self.pos)),
        }
    }

    fn expect_str(&mut self, s: &str) -> Result<(), ParseDrvError> {
        if self.input[self.pos..].starts_with(s) {
            self.pos += s.len();
            Ok(())
        } else {
            let got: String = self.input[self.pos..].chars().take(s.len()).collect();
            Err(ParseDrvError::Expected {
                pos: self.pos,
                expected: format!("{s:?}"),
                got,
            })
        }
    }

    /// A quoted, escaped string field.
    fn parse_string(&mut self) -> Result<String, ParseDrvError> {
        self.expect_char('"')?;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(ParseDrvError::UnexpectedEof(self.pos)),
                Some('"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some('\\') => {
                    self.pos += 1;
                    let c = self.peek().ok_or(ParseDrvError::UnexpectedEof(self.pos))?;
                    out.push(match c {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        c => c,
                    });
                    self.pos += c.len_utf8();
                }
                Some(c) => {
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }

    /// `[item,item,...]` with a caller-supplied item parser.
    fn parse_list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ParseDrvError>,
    ) -> Result<Vec<T>, ParseDrvError> {
        self.expect_char('[')?;
        let mut out = Vec::new();
        if self.peek() == Some(']') {
            self.pos += 1;
            return Ok(out);
        }
        loop {
            out.push(item(self)?);
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(']') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(got) => {
                    return Err(ParseDrvError::Expected {
                        pos: self.pos,
                        expected: "',' or ']'".to_string(),
                        got: got.to_string(),
                    });
                }
                None => return Err(ParseDrvError::UnexpectedEof(self.pos)),
            }
        }
    }
}

pub(super) fn parse(
    store_dir: &StoreDir,
    input: &[u8],
    name: &str,
) -> Result<Derivation, ParseDrvError> {
    let input = std::str::from_utf8(input).map_err(|_| ParseDrvError::NotUtf8)?;
    let mut p = Parser::new(input);

    p.expect_str("Derive(")?;

    // Outputs
    let outputs_raw = p.parse_list(|p| {
        p.expect_char('(')?;
        let name = p.parse_string()?;
        p.expect_char(',')?;
        let path = p.parse_string()?;
        p.expect_char(',')?;
        let method_algo = p.parse_string()?;
        p.expect_char(',')?;
        let digest = p.parse_string()?;
        p.expect_char(')')?;
        Ok((name, path, method_algo, digest))
    })?;
    p.expect_char(',')?;

    // Input derivations
    let input_drvs_raw = p.parse_list(|p| {
        p.expect_char('(')?;
        let path = p.parse_string()?;
        p.expect_char(',')?;
        let outputs = p.parse_list(|p| p.parse_string())?;
        p.expect_char(')')?;
        Ok((path, outputs))
    })?;
    p.expect_char(',')?;

    let input_srcs_raw = p.parse_list(|p| p.parse_string())?;
    p.expect_char(',')?;
    let system = p.parse_string()?;
    p.expect_char(',')?;
    let builder = p.parse_string()?;
    p.expect_char(',')?;
    let args = p.parse_list(|p| p.parse_string())?;
    p.expect_char(',')?;
    let env_raw = p.parse_list(|p| {
        p.expect_char('(')?;
        let k = p.parse_string()?;
        p.expect_char(',')?;
        let v = p.parse_string()?;
        p.expect_char(')')?;
        Ok((k, v))
    })?;
    p.expect_char(')')?;

    if p.pos != input.len() {
        return Err(ParseDrvError::TrailingInput);
    }

    let mut outputs = BTreeMap::new();
    for (out_name, _path, method_algo, digest) in outputs_raw {
        let spec = if method_algo.is_empty() {
            if !digest.is_empty() {
                return Err(ParseDrvError::DigestWithoutMethod(out_name));
            }
            OutputSpec::InputAddressed
        } else {
            let (method, algo) = parse_method_algo(&method_algo)?;
            if digest.is_empty() {
                OutputSpec::CaFloating { method, algo }
            } else {
                let hash = Hash::parse_digest(algo, &digest)?;
                OutputSpec::CaFixed(ContentAddress::from_hash(method, hash).map_err(|_| {
                    ParseDrvError::InvalidMethodAlgo(method_algo.clone())
                })?)
            }
        };
        outputs.insert(out_name, spec);
    }

    let mut input_derivations = BTreeMap::new();
    for (path, outs) in input_drvs_raw {
        let path = store_dir.parse_path(&path)?;
        input_derivations.insert(path, outs.into_iter().collect::<BTreeSet<_>>());
    }

    let mut input_sources = BTreeSet::new();
    for path in input_srcs_raw {
        input_sources.insert(store_dir.parse_path(&path)?);
    }

    Ok(Derivation {
        name: name.to_string(),
        system,
        builder,
        args,
        env: env_raw.into_iter().collect(),
        input_sources,
        input_derivations,
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::placeholder;
    use rstest::rstest;

    fn dir() -> StoreDir {
        StoreDir::default()
    }

    fn example() -> Derivation {
        let mut drv = Derivation {
            name: "hello".into(),
            system: "x86_64-linux".into(),
            builder: "/zb/store/00000000000000000000000000000000-sh/bin/sh".into(),
            args: vec!["-c".into(), "printf 'hi\\n' > \"$out\"".into()],
            ..Default::default()
        };
        drv.env.insert("out".into(), placeholder::hash_placeholder("out"));
        drv.env.insert("weird".into(), "line1\nline2\ttab \"quoted\"".into());
        drv.input_sources.insert(
            "11111111111111111111111111111111-builder.sh".parse().unwrap(),
        );
        drv.input_derivations.insert(
            "22222222222222222222222222222222-dep.drv".parse().unwrap(),
            BTreeSet::from(["out".to_string(), "dev".to_string()]),
        );
        drv.outputs.insert("out".into(), OutputSpec::InputAddressed);
        drv
    }

    #[test]
    fn roundtrip() {
        let drv = example();
        let bytes = drv.marshal(&dir());
        let parsed = Derivation::parse(&dir(), &bytes, "hello").expect("must parse");
        assert_eq!(drv, parsed);
        // And the canonical form is stable.
        assert_eq!(bytes, parsed.marshal(&dir()));
    }

    #[test]
    fn roundtrip_fixed_and_floating() {
        let mut drv = example();
        drv.outputs.insert(
            "out".into(),
            OutputSpec::CaFixed(ContentAddress::Recursive(
                HashAlgo::Sha256.digest("hello world\n"),
            )),
        );
        drv.outputs.insert(
            "lib".into(),
            OutputSpec::CaFloating {
                method: CaMethod::Recursive,
                algo: HashAlgo::Sha256,
            },
        );

        let bytes = drv.marshal(&dir());
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"r:sha256\""));

        let parsed = Derivation::parse(&dir(), &bytes, "hello").unwrap();
        assert_eq!(drv, parsed);
    }

    #[test]
    fn escaping_survives() {
        let mut drv = example();
        drv.env.insert("tricky".into(), "\\back\\slash \"and\" \r\n\t".into());
        let bytes = drv.marshal(&dir());
        let parsed = Derivation::parse(&dir(), &bytes, "hello").unwrap();
        assert_eq!(drv.env, parsed.env);
    }

    #[rstest]
    #[case::empty(b"" as &[u8])]
    #[case::not_a_drv(b"NotDerive()")]
    #[case::truncated(b"Derive([(\"out\",\"\",\"\",\"\")]")]
    #[case::trailing(b"Derive([],[],[],\"s\",\"b\",[],[])x")]
    fn parse_rejects(#[case] input: &[u8]) {
        Derivation::parse(&dir(), input, "x").expect_err("must fail");
    }

    #[test]
    fn parse_rejects_bad_input_paths() {
        let input = br#"Derive([("out","","","")],[("not-a-store-path",["out"])],[],"s","b",[],[])"#;
        let err = Derivation::parse(&dir(), input, "x").unwrap_err();
        assert!(matches!(err, ParseDrvError::InvalidStorePath(_)));
    }

    #[test]
    fn canonical_bytes_are_order_independent() {
        let mut a = example();
        let mut b = example();
        // Insert env keys in different orders; BTreeMap canonicalizes.
        a.env.insert("zzz".into(), "1".into());
        a.env.insert("aaa".into(), "2".into());
        b.env.insert("aaa".into(), "2".into());
        b.env.insert("zzz".into(), "1".into());
        assert_eq!(a.marshal(&dir()), b.marshal(&dir()));
    }
}
