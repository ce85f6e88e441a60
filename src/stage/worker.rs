use std::thread::JoinHandle;

use log::{debug, error, info};

use crate::stage::{dispatch, InputPort, Outputs, StageLogic};

/// A fully wired worker of the execution network, ready to be spawned.
pub(crate) struct StageNode {
    /// Name of the stage, used for the thread name and the logs.
    pub(crate) name: String,
    pub(crate) logic: Box<dyn StageLogic>,
    pub(crate) input: InputPort,
    pub(crate) outputs: Outputs,
}

/// Call a function if this struct goes out of scope without calling `defuse`,
/// including during a panic stack-unwinding.
struct CatchPanic<F: FnOnce()> {
    /// True if the function should be called.
    primed: bool,
    /// Function to call.
    ///
    /// The `Drop` implementation will move out the function.
    handler: Option<F>,
}

impl<F: FnOnce()> CatchPanic<F> {
    fn new(handler: F) -> Self {
        Self {
            primed: true,
            handler: Some(handler),
        }
    }

    /// Avoid calling the function on drop.
    fn defuse(&mut self) {
        self.primed = false;
    }
}

impl<F: FnOnce()> Drop for CatchPanic<F> {
    fn drop(&mut self) {
        if self.primed {
            (self.handler.take().unwrap())();
        }
    }
}

pub(crate) fn spawn_stage(index: usize, node: StageNode) -> JoinHandle<()> {
    let StageNode {
        name,
        logic,
        input,
        outputs,
    } = node;

    debug!("starting stage {index}: {name}");

    std::thread::Builder::new()
        .name(format!("stage-{index:02}-{name}"))
        .spawn(move || do_work(&name, logic, input, outputs))
        .unwrap()
}

fn do_work(
    name: &str,
    mut logic: Box<dyn StageLogic>,
    mut input: InputPort,
    mut outputs: Outputs,
) {
    let mut catch_panic = CatchPanic::new(|| {
        error!("stage {name} crashed!");
    });
    while let Some((from, message)) = input.recv() {
        logic.set_origin(from);
        dispatch(logic.as_mut(), message, &mut outputs);
    }
    catch_panic.defuse();
    info!("stage {name} completed");
}
