//! The pipeline term: the recursive algebraic structure describing what to
//! execute. Built with the fluent methods of [`Pipe`], compiled into a
//! stage network by the [`Executor`](crate::Executor).

use std::fmt::{Display, Formatter};

use crate::iteration::TerminationCondition;
use crate::operator::{BinaryOperatorNode, OperatorClass, OperatorNode, StructureType};

/// A node of the pipeline term.
#[derive(Clone)]
pub(crate) enum Term {
    /// The identity pipeline.
    Empty,
    /// A single operator.
    Operator(Box<dyn OperatorNode>),
    /// Linear composition of sub-pipelines.
    To(Vec<Pipe>),
    /// Two sub-pipelines feeding a binary operator.
    Pair {
        op: Box<dyn BinaryOperatorNode>,
        left: Box<Pipe>,
        right: Box<Pipe>,
    },
    /// A sub-pipeline wrapped in a feedback loop.
    Iterate {
        sub: Box<Pipe>,
        cond: Box<dyn TerminationCondition>,
    },
    /// Reserved: replicate the input across several sub-pipelines.
    MultiTo(Vec<Pipe>),
    /// Reserved: merge the outputs of several sub-pipelines.
    Merge(Vec<Pipe>),
}

/// A composable pipeline of operators.
///
/// ## Example
///
/// ```no_run
/// # use ruscello::prelude::*;
/// let count_words = Pipe::new()
///     .add(FlatMap::new(|line: String, coll: &mut Collector<String>| {
///         for token in line.split_whitespace() {
///             coll.add(token.to_owned());
///         }
///     }))
///     .add(Map::new(|word: String| (word, 1u64)))
///     .add(PReduce::<String, u64, _>::new(|a, b| a + b));
///
/// let pipe = Pipe::new()
///     .add(FileSource::new("input.txt"))
///     .to(count_words)
///     .add(FileSink::new("output.txt", |(w, n): &(String, u64)| {
///         format!("{w} {n}")
///     }));
/// ```
#[derive(Clone, Default)]
pub struct Pipe {
    pub(crate) term: Term,
}

impl Default for Term {
    fn default() -> Self {
        Term::Empty
    }
}

impl Pipe {
    /// The empty (identity) pipeline.
    pub fn new() -> Pipe {
        Pipe { term: Term::Empty }
    }

    /// Append an operator at the end of the pipeline.
    pub fn add<O: OperatorNode + 'static>(self, op: O) -> Pipe {
        self.to(Pipe {
            term: Term::Operator(Box::new(op)),
        })
    }

    /// Append another pipeline at the end of this one.
    pub fn to(self, next: Pipe) -> Pipe {
        let term = match (self.term, next.term) {
            (Term::Empty, term) => term,
            (term, Term::Empty) => term,
            (Term::To(mut children), Term::To(next_children)) => {
                children.extend(next_children);
                Term::To(children)
            }
            (Term::To(mut children), term) => {
                children.push(Pipe { term });
                Term::To(children)
            }
            (term, Term::To(mut next_children)) => {
                let mut children = vec![Pipe { term }];
                children.append(&mut next_children);
                Term::To(children)
            }
            (a, b) => Term::To(vec![Pipe { term: a }, Pipe { term: b }]),
        };
        Pipe { term }
    }

    /// Pair this pipeline with another one, feeding both into a binary
    /// operator. This pipeline is the left side.
    pub fn pair_with<O: BinaryOperatorNode + 'static>(self, right: Pipe, op: O) -> Pipe {
        Pipe {
            term: Term::Pair {
                op: Box::new(op),
                left: Box::new(self),
                right: Box::new(right),
            },
        }
    }

    /// Wrap this pipeline in a feedback loop governed by the termination
    /// condition.
    pub fn iterate<C: TerminationCondition + 'static>(self, cond: C) -> Pipe {
        Pipe {
            term: Term::Iterate {
                sub: Box::new(self),
                cond: Box::new(cond),
            },
        }
    }

    /// Replicate the output of this pipeline across several sub-pipelines.
    /// Declared but not supported by the compiler yet.
    pub fn multi_to(self, children: Vec<Pipe>) -> Pipe {
        let mut all = vec![self];
        all.extend(children);
        Pipe {
            term: Term::MultiTo(all),
        }
    }

    /// Merge the output of this pipeline with other ones. Declared but not
    /// supported by the compiler yet.
    pub fn merge_with(self, others: Vec<Pipe>) -> Pipe {
        let mut all = vec![self];
        all.extend(others);
        Pipe {
            term: Term::Merge(all),
        }
    }

    /// Input arity of the pipeline: 0 when it starts with a source, 1
    /// otherwise.
    pub fn in_deg(&self) -> usize {
        match &self.term {
            Term::Empty => 1,
            Term::Operator(op) => {
                if op.operator_class() == OperatorClass::Input {
                    0
                } else {
                    1
                }
            }
            Term::To(children) => children
                .first()
                .map(|child| child.in_deg())
                .unwrap_or(1),
            Term::Pair { left, right, .. } => {
                if left.in_deg() > 0 || right.in_deg() > 0 {
                    1
                } else {
                    0
                }
            }
            Term::Iterate { sub, .. } => sub.in_deg(),
            Term::MultiTo(children) | Term::Merge(children) => children
                .first()
                .map(|child| child.in_deg())
                .unwrap_or(1),
        }
    }

    /// Structure of the flow, declared by the first source of the pipeline.
    pub fn structure_type(&self) -> Option<StructureType> {
        match &self.term {
            Term::Empty => None,
            Term::Operator(op) => op.structure(),
            Term::To(children) | Term::MultiTo(children) | Term::Merge(children) => {
                children.iter().find_map(|child| child.structure_type())
            }
            Term::Pair { left, right, .. } => {
                left.structure_type().or_else(|| right.structure_type())
            }
            Term::Iterate { sub, .. } => sub.structure_type(),
        }
    }
}

impl Display for Pipe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.term {
            Term::Empty => write!(f, "Empty"),
            Term::Operator(op) => write!(f, "{}", op.name()),
            Term::To(children) => {
                let mut first = true;
                for child in children {
                    if !first {
                        write!(f, " -> ")?;
                    }
                    first = false;
                    write!(f, "{child}")?;
                }
                Ok(())
            }
            Term::Pair { op, left, right } => {
                write!(f, "pair({left}, {right}) -> {}", op.name())
            }
            Term::Iterate { sub, .. } => write!(f, "iterate({sub})"),
            Term::MultiTo(children) => write!(f, "multi-to[{}]", children.len()),
            Term::Merge(children) => write!(f, "merge[{}]", children.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::source::IteratorSource;
    use crate::operator::Map;

    #[test]
    fn in_deg_of_sources() {
        let source = Pipe::new().add(IteratorSource::new(0..10));
        assert_eq!(source.in_deg(), 0);

        let mapped = Pipe::new().add(Map::new(|x: i32| x + 1));
        assert_eq!(mapped.in_deg(), 1);

        assert_eq!(Pipe::new().in_deg(), 1);
    }

    #[test]
    fn structure_from_source() {
        let bag = Pipe::new().add(IteratorSource::new(0..10));
        assert_eq!(bag.structure_type(), Some(StructureType::Bag));

        let stream = Pipe::new().add(IteratorSource::ordered(0..10));
        assert_eq!(stream.structure_type(), Some(StructureType::Stream));

        assert_eq!(Pipe::new().structure_type(), None);
    }

    #[test]
    fn to_flattens_chains() {
        let a = Pipe::new().add(Map::new(|x: i32| x + 1));
        let b = Pipe::new()
            .add(Map::new(|x: i32| x * 2))
            .add(Map::new(|x: i32| x - 1));
        let chained = a.to(b);
        match chained.term {
            Term::To(children) => assert_eq!(children.len(), 3),
            _ => panic!("expected a flattened chain"),
        }
    }
}
