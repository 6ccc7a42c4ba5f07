use std::collections::HashMap;

use crate::instruction::actions::{
    AddToVariable, AsyncWait, Copy, Equals, Fail, GreaterThan, Input, LogInstruction, Message,
    Output, ResetVariable, Succeed, VarExists, Wait,
};
use crate::instruction::compounds::{Fallback, Include, ParallelSequence, Sequence};
use crate::instruction::decorators::{ForceResult, Inverter, Listen, Repeat};
use crate::instruction::InstructionBehavior;

pub type InstructionConstructor = fn() -> Box<dyn InstructionBehavior>;

/// Name → constructor registry of instruction kinds. The defaults cover all
/// built-ins; plugins register additional kinds at startup.
pub struct InstructionRegistry {
    constructors: HashMap<String, InstructionConstructor>,
}

impl InstructionRegistry {
    pub fn empty() -> Self {
        InstructionRegistry {
            constructors: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = InstructionRegistry::empty();
        registry.register(Wait::TYPE, || Box::<Wait>::default());
        registry.register(AsyncWait::TYPE, || Box::<AsyncWait>::default());
        registry.register(Copy::TYPE, || Box::<Copy>::default());
        registry.register(AddToVariable::INCREMENT_TYPE, || {
            Box::new(AddToVariable::increment())
        });
        registry.register(AddToVariable::DECREMENT_TYPE, || {
            Box::new(AddToVariable::decrement())
        });
        registry.register(Equals::TYPE, || Box::<Equals>::default());
        registry.register(GreaterThan::TYPE, || Box::<GreaterThan>::default());
        registry.register(Output::TYPE, || Box::<Output>::default());
        registry.register(Input::TYPE, || Box::<Input>::default());
        registry.register(Message::TYPE, || Box::<Message>::default());
        registry.register(LogInstruction::TYPE, || Box::<LogInstruction>::default());
        registry.register(Succeed::TYPE, || Box::<Succeed>::default());
        registry.register(Fail::TYPE, || Box::<Fail>::default());
        registry.register(ResetVariable::TYPE, || Box::<ResetVariable>::default());
        registry.register(VarExists::TYPE, || Box::<VarExists>::default());
        registry.register(Inverter::TYPE, || Box::<Inverter>::default());
        registry.register(ForceResult::SUCCESS_TYPE, || Box::new(ForceResult::success()));
        registry.register(ForceResult::FAILURE_TYPE, || Box::new(ForceResult::failure()));
        registry.register(Repeat::TYPE, || Box::<Repeat>::default());
        registry.register(Listen::TYPE, || Box::<Listen>::default());
        registry.register(Sequence::TYPE, || Box::<Sequence>::default());
        registry.register(Fallback::TYPE, || Box::<Fallback>::default());
        registry.register(ParallelSequence::TYPE, || {
            Box::<ParallelSequence>::default()
        });
        registry.register(Include::TYPE, || Box::<Include>::default());
        registry
    }

    /// Register a constructor; returns false when the name was taken.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        constructor: InstructionConstructor,
    ) -> bool {
        let type_name = type_name.into();
        if self.constructors.contains_key(&type_name) {
            return false;
        }
        self.constructors.insert(type_name, constructor);
        true
    }

    pub fn create(&self, type_name: &str) -> Option<Box<dyn InstructionBehavior>> {
        self.constructors.get(type_name).map(|ctor| ctor())
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for InstructionRegistry {
    fn default() -> Self {
        InstructionRegistry::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Category;

    #[test]
    fn defaults_cover_all_builtin_kinds() {
        let registry = InstructionRegistry::with_defaults();
        for name in [
            "Wait",
            "AsyncWait",
            "Copy",
            "Increment",
            "Decrement",
            "Equals",
            "GreaterThan",
            "Output",
            "Input",
            "Message",
            "Log",
            "Succeed",
            "Fail",
            "ResetVariable",
            "VarExists",
            "Inverter",
            "ForceSuccess",
            "ForceFailure",
            "Repeat",
            "Listen",
            "Sequence",
            "Fallback",
            "ParallelSequence",
            "Include",
        ] {
            assert!(registry.is_registered(name), "missing {name}");
        }
    }

    #[test]
    fn registration_rejects_duplicates() {
        let mut registry = InstructionRegistry::with_defaults();
        assert!(!registry.register("Wait", || Box::<crate::instruction::actions::Wait>::default()));
    }

    #[test]
    fn created_behaviours_report_their_category() {
        let registry = InstructionRegistry::with_defaults();
        assert_eq!(registry.create("Wait").unwrap().category(), Category::Action);
        assert_eq!(
            registry.create("Inverter").unwrap().category(),
            Category::Decorator
        );
        assert_eq!(
            registry.create("Sequence").unwrap().category(),
            Category::Compound
        );
    }
}
