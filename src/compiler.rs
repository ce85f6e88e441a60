//! The pipeline compiler: walks the pipeline term recursively and produces
//! the wired stage network, choosing the per-stage farm structure and
//! applying peephole fusions where adjacent operators allow it.

use log::debug;

use crate::batch::Side;
use crate::config::Config;
use crate::fabric::{Network, NetworkBuilder};
use crate::operator::{OperatorClass, OperatorNode, StructureType};
use crate::pair::{PairCollector, PairEmitter};
use crate::pipe::{Pipe, Term};

/// Errors detected while compiling a pipeline term into a network.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("unsupported pipeline term: {0}")]
    Unsupported(&'static str),

    #[error("operator {operator} cannot consume a {structure:?} flow")]
    StructureMismatch {
        operator: &'static str,
        structure: StructureType,
    },

    #[error("fusion does not apply to this operator pair")]
    FusionUnsupported,
}

/// Compile a pipeline into a spawnable network of stages.
pub(crate) fn compile(pipe: &Pipe, config: &Config) -> Result<Network, CompileError> {
    let structure = pipe.structure_type().unwrap_or(StructureType::Bag);
    debug!("compiling pipeline [{structure:?}]: {pipe}");
    let (input, mut builder) = NetworkBuilder::new(config.clone());
    compile_term(pipe, structure, &mut builder)?;
    Ok(builder.finish(input))
}

fn resolve_par(requested: Option<usize>, config: &Config) -> usize {
    requested.unwrap_or(config.parallelism).max(1)
}

fn compile_term(
    pipe: &Pipe,
    structure: StructureType,
    builder: &mut NetworkBuilder,
) -> Result<(), CompileError> {
    match &pipe.term {
        Term::Empty => {
            builder.add_filter("forward", Box::new(crate::stage::Forward));
            Ok(())
        }
        Term::Operator(op) => compile_operator(op.as_ref(), structure, builder),
        Term::To(children) => compile_chain(children, structure, builder),
        Term::Iterate { sub, cond } => {
            builder.add_iteration(cond.as_ref(), |builder| {
                compile_term(sub, structure, builder)
            })
        }
        Term::Pair { op, left, right } => {
            let route = if left.in_deg() > 0 {
                Some(Side::Left)
            } else if right.in_deg() > 0 {
                Some(Side::Right)
            } else {
                None
            };
            builder.add_pair(
                Box::new(PairEmitter::new(route)),
                Box::new(PairCollector::new()),
                |builder| compile_term(left, structure, builder),
                |builder| compile_term(right, structure, builder),
            )?;
            // the binary operator consumes the origin-decorated merge
            let par = resolve_par(op.pardeg(), builder.config());
            let left_input = left.in_deg() > 0;
            op.make_stage(par, left_input, structure, builder)
        }
        Term::MultiTo(_) => Err(CompileError::Unsupported("multi-to")),
        Term::Merge(_) => Err(CompileError::Unsupported("merge")),
    }
}

fn compile_operator(
    op: &dyn OperatorNode,
    structure: StructureType,
    builder: &mut NetworkBuilder,
) -> Result<(), CompileError> {
    if !op.accepts(structure) {
        return Err(CompileError::StructureMismatch {
            operator: op.name(),
            structure,
        });
    }
    let par = resolve_par(op.pardeg(), builder.config());
    op.make_stage(par, structure, builder)
}

/// Compile a linear chain, replacing each recognised pair of adjacent
/// operators with the fused stage.
fn compile_chain(
    children: &[Pipe],
    structure: StructureType,
    builder: &mut NetworkBuilder,
) -> Result<(), CompileError> {
    let mut i = 0;
    while i < children.len() {
        if i + 1 < children.len() {
            if let (Term::Operator(a), Term::Operator(b)) =
                (&children[i].term, &children[i + 1].term)
            {
                if fuses(a.as_ref(), b.as_ref()) {
                    let par = resolve_par(a.pardeg(), builder.config());
                    match b.make_fused_stage(a.as_ref(), par, structure, builder) {
                        Ok(()) => {
                            debug!("fused {} with {}", a.name(), b.name());
                            i += 2;
                            continue;
                        }
                        // fall back to two plain stages
                        Err(CompileError::FusionUnsupported) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        compile_term(&children[i], structure, builder)?;
        i += 1;
    }
    Ok(())
}

fn fuses(a: &dyn OperatorNode, b: &dyn OperatorNode) -> bool {
    a.operator_class().is_map_like() && b.operator_class() == OperatorClass::PReduce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::source::IteratorSource;
    use crate::operator::{FlatMap, Map, PReduce};

    fn config() -> Config {
        Config {
            parallelism: 2,
            ..Config::default()
        }
    }

    #[test]
    fn multito_and_merge_are_rejected() {
        let pipe = Pipe::new()
            .add(IteratorSource::new(0..4))
            .multi_to(vec![Pipe::new()]);
        assert!(matches!(
            compile(&pipe, &config()),
            Err(CompileError::Unsupported("multi-to"))
        ));

        let pipe = Pipe::new()
            .add(IteratorSource::new(0..4))
            .merge_with(vec![Pipe::new()]);
        assert!(matches!(
            compile(&pipe, &config()),
            Err(CompileError::Unsupported("merge"))
        ));
    }

    #[test]
    fn structure_mismatch_is_rejected() {
        // an ordered source downstream of a bag source
        let pipe = Pipe::new()
            .add(IteratorSource::new(0..4))
            .add(IteratorSource::ordered(0..4));
        assert!(matches!(
            compile(&pipe, &config()),
            Err(CompileError::StructureMismatch { .. })
        ));
    }

    #[test]
    fn map_preduce_chain_is_fused() {
        let pipe = Pipe::new()
            .add(IteratorSource::new(0..4))
            .add(Map::new(|x: i32| (x % 2, x)))
            .add(PReduce::<i32, i32, _>::new(|a, b| a + b));
        let network = compile(&pipe, &config()).unwrap();
        let names: Vec<_> = network.stages.iter().map(|s| s.name.clone()).collect();
        assert!(names.iter().any(|n| n.starts_with("map-p-reduce")));
        // the plain map and p-reduce stages are gone
        assert!(!names.iter().any(|n| n == "map" || n.starts_with("map[")));
    }

    #[test]
    fn flatmap_preduce_chain_is_fused() {
        let pipe = Pipe::new()
            .add(IteratorSource::new(0..4))
            .add(FlatMap::new(|x: i32, coll: &mut crate::operator::Collector<(i32, i32)>| {
                coll.add((x, 1));
            }))
            .add(PReduce::<i32, i32, _>::new(|a, b| a + b));
        let network = compile(&pipe, &config()).unwrap();
        let names: Vec<_> = network.stages.iter().map(|s| s.name.clone()).collect();
        assert!(names.iter().any(|n| n.starts_with("map-p-reduce")));
    }

    #[test]
    fn empty_pipeline_compiles_to_forward() {
        let network = compile(&Pipe::new(), &config()).unwrap();
        assert_eq!(network.stages.len(), 1);
        assert_eq!(network.stages[0].name, "forward");
    }
}
