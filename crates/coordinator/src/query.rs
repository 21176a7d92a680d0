use crate::config::SchedulerSettings;
use crate::exchange::ExchangeInput;
use crate::stage::StageInfo;
use crate::state_machine::{State, StateMachine};
use crate::task::TaskFailureListener;
use igloo_common::{ErrorCode, ExecutionFailure, QueryId, TaskId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryState {
    Queued,
    Planning,
    Starting,
    Running,
    Finishing,
    Finished,
    Failed,
}

impl State for QueryState {
    fn is_done(&self) -> bool {
        matches!(self, QueryState::Finished | QueryState::Failed)
    }
}

impl QueryState {
    pub fn is_done(&self) -> bool {
        State::is_done(self)
    }
}

/// Per-query context: the query id plus the settings it runs with.
#[derive(Debug, Clone)]
pub struct Session {
    query_id: QueryId,
    settings: Arc<SchedulerSettings>,
}

impl Session {
    pub fn new(query_id: QueryId, settings: SchedulerSettings) -> Self {
        Self {
            query_id,
            settings: Arc::new(settings),
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }
}

/// Where the client reads query results from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutputs {
    pub inputs: Vec<ExchangeInput>,
    pub no_more_inputs: bool,
}

pub struct QueryStateMachine {
    session: Session,
    executor: Handle,
    state: StateMachine<QueryState>,
    failure_cause: Mutex<Option<ExecutionFailure>>,
    outputs: Mutex<QueryOutputs>,
    output_task_failure_listeners: Mutex<Vec<Arc<dyn TaskFailureListener>>>,
    final_stage_info: Mutex<Option<StageInfo>>,
}

impl QueryStateMachine {
    /// `executor` runs every state change notification of this query and of
    /// the schedulers created for it.
    pub fn new(session: Session, executor: Handle) -> Arc<Self> {
        let state = StateMachine::new(format!("query {}", session.query_id()), executor.clone(), QueryState::Queued);
        Arc::new(Self {
            session,
            executor,
            state,
            failure_cause: Mutex::new(None),
            outputs: Mutex::new(QueryOutputs::default()),
            output_task_failure_listeners: Mutex::new(Vec::new()),
            final_stage_info: Mutex::new(None),
        })
    }

    pub fn query_id(&self) -> &QueryId {
        self.session.query_id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn executor(&self) -> &Handle {
        &self.executor
    }

    pub fn state(&self) -> QueryState {
        self.state.get()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn transition_to_planning(&self) -> bool {
        self.state.set_if(QueryState::Planning, |current| current < QueryState::Planning)
    }

    pub fn transition_to_starting(&self) -> bool {
        self.state.set_if(QueryState::Starting, |current| current < QueryState::Starting)
    }

    pub fn transition_to_running(&self) -> bool {
        self.state.set_if(QueryState::Running, |current| current < QueryState::Running)
    }

    pub fn transition_to_finishing(&self) -> bool {
        self.state.set_if(QueryState::Finishing, |current| current < QueryState::Finishing)
    }

    pub fn transition_to_finished(&self) -> bool {
        self.state.set(QueryState::Finished)
    }

    pub fn transition_to_failed(&self, cause: ExecutionFailure) -> bool {
        {
            let mut failure_cause = self.failure_cause.lock();
            if failure_cause.is_none() && !self.is_done() {
                *failure_cause = Some(cause.clone());
            }
        }
        let failed = self.state.set(QueryState::Failed);
        if failed {
            info!("Query {} failed: {}", self.query_id(), cause);
        } else {
            debug!("Failure after query {} finished: {}", self.query_id(), cause);
        }
        failed
    }

    pub fn transition_to_canceled(&self) -> bool {
        self.transition_to_failed(ExecutionFailure::new(ErrorCode::USER_CANCELED, "Query was canceled"))
    }

    pub fn failure_cause(&self) -> Option<ExecutionFailure> {
        self.failure_cause.lock().clone()
    }

    pub fn add_state_change_listener(&self, listener: impl Fn(QueryState) + Send + Sync + 'static) {
        self.state.add_listener(listener);
    }

    pub async fn wait_for_state(&self, predicate: impl Fn(QueryState) -> bool) -> QueryState {
        self.state.wait_for(predicate).await
    }

    pub fn update_inputs_for_query_results(&self, inputs: Vec<ExchangeInput>, no_more_inputs: bool) {
        let mut outputs = self.outputs.lock();
        outputs.inputs.extend(inputs);
        outputs.no_more_inputs |= no_more_inputs;
    }

    pub fn query_outputs(&self) -> QueryOutputs {
        self.outputs.lock().clone()
    }

    pub fn add_output_task_failure_listener(&self, listener: Arc<dyn TaskFailureListener>) {
        self.output_task_failure_listeners.lock().push(listener);
    }

    /// Called by the result reader when fetching from an output task fails.
    pub fn output_task_failed(&self, task_id: &TaskId, failure: &ExecutionFailure) {
        let listeners = self.output_task_failure_listeners.lock().clone();
        for listener in listeners {
            listener.on_task_failed(task_id, failure);
        }
    }

    pub fn update_query_info(&self, stage_info: Option<StageInfo>) {
        *self.final_stage_info.lock() = stage_info;
    }

    pub fn final_stage_info(&self) -> Option<StageInfo> {
        self.final_stage_info.lock().clone()
    }
}
