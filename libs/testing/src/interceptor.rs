use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;

use interpose_core::{
    CoreHandle, Interceptor, InterceptorError, InterceptorFactory, ModuleSpec, Pdu, PduQueue,
    Verdict,
};

use crate::{Trace, TraceEvent, SCRIPTED_INTERCEPTOR};

/// What a [`ScriptedInterceptor`] does with each PDU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "behavior")]
pub enum Behavior {
    /// Record and forward.
    #[default]
    Record,
    /// Add `tag` and forward.
    Tag { tag: String },
    /// Consume PDUs carrying `tag`, forward the rest.
    DropTagged { tag: String },
    /// Consume every PDU into a queue for later release.
    Hold,
    /// Reject `prepare`.
    FailPrepare,
    /// Fail every `intercept` call.
    FailIntercept,
}

/// Interceptor whose behavior comes from its module config.
///
/// Every call is recorded in the shared [`Trace`].
pub struct ScriptedInterceptor {
    id: usize,
    code: String,
    behavior: Behavior,
    trace: Trace,
    held: PduQueue,
}

impl ScriptedInterceptor {
    pub fn new(id: usize, code: impl Into<String>, behavior: Behavior, trace: Trace) -> Self {
        Self {
            id,
            code: code.into(),
            behavior,
            trace,
            held: PduQueue::new(),
        }
    }

    pub fn behavior(&self) -> &Behavior {
        &self.behavior
    }

    /// Next held PDU, if any.
    pub fn release(&self) -> Option<Pdu> {
        self.held.poll()
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }
}

#[async_trait]
impl Interceptor for ScriptedInterceptor {
    fn id(&self) -> usize {
        self.id
    }

    fn code(&self) -> &str {
        &self.code
    }

    async fn prepare(&self) -> Result<(), InterceptorError> {
        self.trace.lifecycle(&self.code, "prepare");
        match self.behavior {
            Behavior::FailPrepare => Err(InterceptorError::failed(&self.code, "scripted prepare failure")),
            _ => Ok(()),
        }
    }

    async fn intercept(&self, mut pdu: Pdu) -> Result<Verdict, InterceptorError> {
        self.trace.push(TraceEvent::Intercepted {
            module: self.code.clone(),
            destination: pdu.destination(),
            payload: pdu.payload().to_vec(),
        });

        match &self.behavior {
            Behavior::Record | Behavior::FailPrepare => Ok(Verdict::Forward(pdu)),
            Behavior::Tag { tag } => {
                pdu.add_tag(tag.clone());
                Ok(Verdict::Forward(pdu))
            }
            Behavior::DropTagged { tag } if pdu.has_tag(tag) => Ok(Verdict::Consumed),
            Behavior::DropTagged { .. } => Ok(Verdict::Forward(pdu)),
            Behavior::Hold => {
                self.held.add(pdu);
                Ok(Verdict::Consumed)
            }
            Behavior::FailIntercept => Err(InterceptorError::failed(&self.code, "scripted intercept failure")),
        }
    }

    async fn stop(&self) {
        self.trace.lifecycle(&self.code, "stop");
        self.held.clear();
    }
}

/// Builds [`ScriptedInterceptor`]s and keeps them reachable by module code.
pub struct ScriptedInterceptorFactory {
    trace: Trace,
    created: Mutex<HashMap<String, Arc<ScriptedInterceptor>>>,
}

impl ScriptedInterceptorFactory {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            created: Mutex::new(HashMap::new()),
        }
    }

    /// Most recently created interceptor for `module`.
    pub fn interceptor(&self, module: &str) -> Option<Arc<ScriptedInterceptor>> {
        self.created.lock().unwrap().get(module).cloned()
    }

    /// Module spec for this factory.
    pub fn module(code: &str, behavior: serde_json::Value) -> ModuleSpec {
        ModuleSpec::new(code, SCRIPTED_INTERCEPTOR).with_config(behavior)
    }
}

impl InterceptorFactory for ScriptedInterceptorFactory {
    fn code(&self) -> &str {
        SCRIPTED_INTERCEPTOR
    }

    fn create_interceptor(
        &self,
        id: usize,
        module: &ModuleSpec,
        _core: CoreHandle,
    ) -> Result<Arc<dyn Interceptor>, InterceptorError> {
        let behavior: Behavior = if module.config.is_null() {
            Behavior::default()
        } else {
            serde_json::from_value(module.config.clone()).map_err(anyhow::Error::from)?
        };

        let interceptor = Arc::new(ScriptedInterceptor::new(
            id,
            &module.code,
            behavior,
            self.trace.clone(),
        ));
        self.created
            .lock()
            .unwrap()
            .insert(module.code.clone(), Arc::clone(&interceptor));
        Ok(interceptor)
    }
}
