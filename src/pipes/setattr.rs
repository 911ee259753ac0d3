//! Set-attributes pipe: copies a dictionary template onto every ref.

use crate::attr::{AttributeRef, Dictionary};
use crate::error::{Error, Result};
use crate::pipe::{Command, OutputHelper, Pipe, PipeCore, PipeManager, PipeOps, Teardown, fourcc};
use crate::probe::Probe;
use crate::pump::Pump;
use std::sync::{Arc, Mutex, PoisonError};

/// Signature of set-attributes pipes.
pub const SETATTR_SIGNATURE: u32 = fourcc(b"seta");

/// Custom command replacing the template of one pipe. Payload:
/// `Option<Dictionary>`, taken by the pipe.
pub const SETATTR_SET_TEMPLATE: u32 = 1;

/// Allocates pipes that merge `template` into each ref they forward.
#[derive(Debug, Clone)]
pub struct SetAttrManager {
    template: Arc<Dictionary>,
}

impl SetAttrManager {
    /// Pipes starting with `template`.
    pub fn new(template: Dictionary) -> Self {
        Self {
            template: Arc::new(template),
        }
    }
}

impl PipeManager for SetAttrManager {
    fn signature(&self) -> u32 {
        SETATTR_SIGNATURE
    }

    fn name(&self) -> &'static str {
        "setattr"
    }

    fn alloc(&self, probe: Probe) -> Result<Pipe> {
        let pipe = PipeCore::create(self, probe, |_| {
            Ok(SetAttrOps {
                output: OutputHelper::new(),
                template: Mutex::new(Arc::clone(&self.template)),
            })
        })?;
        pipe.throw_ready();
        Ok(pipe)
    }
}

struct SetAttrOps {
    output: OutputHelper,
    template: Mutex<Arc<Dictionary>>,
}

impl PipeOps for SetAttrOps {
    fn input(&self, pipe: &PipeCore, mut uref: AttributeRef, pump: Option<&Pump>) {
        let template = self.template.lock().unwrap_or_else(PoisonError::into_inner).clone();
        uref.dict_mut().merge(&template);
        self.output.output(pipe, uref, pump);
    }

    fn control(&self, pipe: &PipeCore, command: &mut Command) -> Result<()> {
        match command {
            Command::SetFlowDef(flow_def) => {
                self.output.store_flow_def(pipe, flow_def.duplicate());
                Ok(())
            }
            Command::Custom {
                signature,
                command: SETATTR_SET_TEMPLATE,
                payload,
            } if *signature == SETATTR_SIGNATURE => {
                let template = payload
                    .downcast_mut::<Option<Dictionary>>()
                    .and_then(Option::take)
                    .ok_or_else(|| Error::invalid("set_template expects a dictionary"))?;
                *self.template.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(template);
                Ok(())
            }
            _ => self.output.control(pipe, command),
        }
    }

    fn no_ref(&self, _pipe: &PipeCore) -> Teardown {
        self.output.clean();
        Teardown::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{AttributeRefManager, Value, flow};
    use crate::pipes::CaptureManager;

    #[test]
    fn test_template_merged_over_ref() {
        let urefs = AttributeRefManager::new();
        let mut template = Dictionary::new();
        template.set("program", Value::String(String::from("news")));
        template.set("seq", Value::Unsigned(99));
        let pipe = SetAttrManager::new(template).alloc(Probe::end()).unwrap();
        let (capture, handle) = CaptureManager::new().alloc_capture(Probe::end()).unwrap();
        pipe.set_output(&capture).unwrap();
        pipe.set_flow_def(&flow::alloc_def(&urefs, "void.")).unwrap();

        let mut uref = urefs.alloc();
        uref.set_unsigned("seq", 1);
        uref.set_string("keep", "me");
        pipe.input(uref, None);

        let out = &handle.refs()[0];
        assert_eq!(out.get_string("program"), Some("news"));
        assert_eq!(out.get_unsigned("seq"), Some(99));
        assert_eq!(out.get_string("keep"), Some("me"));
    }

    #[test]
    fn test_replace_template() {
        let urefs = AttributeRefManager::new();
        let pipe = SetAttrManager::new(Dictionary::new()).alloc(Probe::end()).unwrap();
        let (capture, handle) = CaptureManager::new().alloc_capture(Probe::end()).unwrap();
        pipe.set_output(&capture).unwrap();
        pipe.set_flow_def(&flow::alloc_def(&urefs, "void.")).unwrap();

        let mut template = Dictionary::new();
        template.set("lang", Value::String(String::from("fra")));
        let mut command = Command::Custom {
            signature: SETATTR_SIGNATURE,
            command: SETATTR_SET_TEMPLATE,
            payload: Box::new(Some(template)),
        };
        pipe.control(&mut command).unwrap();
        pipe.input(urefs.alloc(), None);
        assert_eq!(handle.refs()[0].get_string("lang"), Some("fra"));
    }
}
