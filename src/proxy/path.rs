//! Path matching.
//!
//! Every request selects at most one path rule. `Exact` rules compare the
//! cleaned pattern against the request path as received. `Prefix` rules
//! compare slash-delimited elements one by one, so `/pre` does not match
//! `/prefix/x` the way a string prefix test would.
//!
//! Weights decide the winner: an `Exact` hit pins the maximum representable
//! weight so it beats any prefix, a `Prefix` hit weighs its element count
//! plus one so the more specific prefix wins. Ties go to the first candidate
//! in iteration order.

/// How a pattern matches. `ImplementationSpecific` entries are mapped to
/// `Prefix` before they get here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Exact,
    Prefix,
}

/// A single path rule with an opaque backend handle.
#[derive(Debug, Clone)]
pub struct Candidate<T> {
    kind: PathKind,
    pattern: String,
    elements: Vec<String>,
    pub backend: T,
}

impl<T> Candidate<T> {
    pub fn exact(path: &str, backend: T) -> Self {
        Self::new(PathKind::Exact, path, backend)
    }

    pub fn prefix(path: &str, backend: T) -> Self {
        Self::new(PathKind::Prefix, path, backend)
    }

    fn new(kind: PathKind, path: &str, backend: T) -> Self {
        let elements: Vec<String> = elements_of(path).map(str::to_string).collect();
        Self {
            kind,
            pattern: rooted(&elements),
            elements,
            backend,
        }
    }

    pub fn kind(&self) -> PathKind {
        self.kind
    }

    /// The cleaned, leading-slash-rooted pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Match weight against a request path; zero means no match.
    fn weight(&self, request_path: &str) -> usize {
        match self.kind {
            PathKind::Exact => {
                if self.pattern == request_path {
                    usize::MAX
                } else {
                    0
                }
            }
            PathKind::Prefix => {
                let mut request = elements_of(request_path);
                for element in &self.elements {
                    if request.next() != Some(element.as_str()) {
                        return 0;
                    }
                }
                self.elements.len() + 1
            }
        }
    }
}

/// Non-empty slash-delimited elements of a path.
pub fn elements_of(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|element| !element.is_empty())
}

/// Canonicalize a path to its leading-slash-rooted form.
pub fn clean(path: &str) -> String {
    let elements: Vec<&str> = elements_of(path).collect();
    rooted(&elements)
}

fn rooted<S: AsRef<str>>(elements: &[S]) -> String {
    let mut out = String::new();
    for element in elements {
        out.push('/');
        out.push_str(element.as_ref());
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Pick the candidate with the strictly largest weight; the first such
/// candidate wins ties. None when nothing has positive weight.
pub fn select<'a, T>(request_path: &str, candidates: &'a [Candidate<T>]) -> Option<&'a Candidate<T>> {
    let mut strongest = 0;
    let mut winner = None;

    for candidate in candidates {
        let weight = candidate.weight(request_path);
        if weight > strongest {
            strongest = weight;
            winner = Some(candidate);
        }
    }

    winner
}
