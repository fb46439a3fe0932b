//! Command Database
//!
//! Every SCM instruction is a 16-bit opcode (bit 15 is the not-flag, bits
//! 0..14 the command id) followed by a type-tagged argument list. This
//! module holds the per-command argument schemas the disassembler walks and
//! the well-known command roles the flow analyzer keys on.
//!
//! The database is data: definitions deserialize from JSON so embedders can
//! supply the table for their engine revision. [`Commands::default_table`]
//! ships the well-known subset used by the tests.

use serde::Deserialize;
use std::collections::HashMap;

/// Schema type of a single command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    /// Integer immediate (any width) or variable holding one.
    Int,
    /// Float immediate or variable holding one.
    Float,
    /// Variable reference only.
    Var,
    /// Integer immediate interpreted as a branch/call target.
    Label,
    /// String argument (fixed or variable length storage).
    String,
    /// Any argument kind is acceptable.
    Any,
}

/// Schema of a single argument slot.
///
/// The trailing run of `optional` slots forms a group that repeats until the
/// end-of-argument-list marker; this is how variadic commands (`SWITCH_*`,
/// script spawns with setup values) express their arity.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ArgSchema {
    #[serde(rename = "type")]
    pub arg_type: ArgType,
    #[serde(default)]
    pub optional: bool,
}

impl ArgSchema {
    pub const fn required(arg_type: ArgType) -> Self {
        Self {
            arg_type,
            optional: false,
        }
    }

    pub const fn repeated(arg_type: ArgType) -> Self {
        Self {
            arg_type,
            optional: true,
        }
    }
}

/// Definition of one command as provided by the database.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandDef {
    pub id: u16,
    pub name: String,
    #[serde(default)]
    pub args: Vec<ArgSchema>,
}

/// Resolved ids of the commands the analyzer gives special meaning to.
///
/// Resolution is by name, so tables for different engine revisions can map
/// the same role onto different ids. Absent entries simply disable the
/// corresponding treatment.
#[derive(Debug, Clone, Copy, Default)]
struct WellKnown {
    nop: Option<u16>,
    wait: Option<u16>,
    goto_: Option<u16>,
    goto_if_false: Option<u16>,
    return_: Option<u16>,
    terminate_this_script: Option<u16>,
    end_thread: Option<u16>,
    gosub: Option<u16>,
    gosub_file: Option<u16>,
    start_new_script: Option<u16>,
    launch_mission: Option<u16>,
    load_and_launch_mission: Option<u16>,
    switch_start: Option<u16>,
    switch_continued: Option<u16>,
    script_name: Option<u16>,
    andor: Option<u16>,
}

/// The command database consulted by every stage.
#[derive(Debug)]
pub struct Commands {
    defs: HashMap<u16, CommandDef>,
    well_known: WellKnown,
}

impl Commands {
    /// Builds the database from a list of definitions. Later definitions
    /// with a duplicate id replace earlier ones.
    pub fn new(defs: Vec<CommandDef>) -> Self {
        let mut map: HashMap<u16, CommandDef> = HashMap::with_capacity(defs.len());
        for def in defs {
            map.insert(def.id, def);
        }

        let find = |name: &str| -> Option<u16> {
            map.values().find(|d| d.name == name).map(|d| d.id)
        };

        let well_known = WellKnown {
            nop: find("NOP"),
            wait: find("WAIT"),
            goto_: find("GOTO"),
            goto_if_false: find("GOTO_IF_FALSE"),
            return_: find("RETURN"),
            terminate_this_script: find("TERMINATE_THIS_SCRIPT"),
            end_thread: find("END_THREAD"),
            gosub: find("GOSUB"),
            gosub_file: find("GOSUB_FILE"),
            start_new_script: find("START_NEW_SCRIPT"),
            launch_mission: find("LAUNCH_MISSION"),
            load_and_launch_mission: find("LOAD_AND_LAUNCH_MISSION"),
            switch_start: find("SWITCH_START"),
            switch_continued: find("SWITCH_CONTINUED"),
            script_name: find("SCRIPT_NAME"),
            andor: find("ANDOR"),
        };

        Self {
            defs: map,
            well_known,
        }
    }

    /// Looks up a command definition by id (the not-flag must already be
    /// masked off).
    pub fn get(&self, id: u16) -> Option<&CommandDef> {
        self.defs.get(&id)
    }

    /// Resolves a command id by name.
    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.defs.values().find(|d| d.name == name).map(|d| d.id)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// `GOTO`: transfers control without a fall-through path.
    pub fn is_unconditional_branch(&self, id: u16) -> bool {
        self.well_known.goto_ == Some(id)
    }

    /// `GOTO_IF_FALSE` family: branches on the falsy path, falls through on
    /// the truthy one.
    pub fn is_conditional_branch(&self, id: u16) -> bool {
        self.well_known.goto_if_false == Some(id)
    }

    /// `RETURN` / `TERMINATE_THIS_SCRIPT` / `END_THREAD`: ends the enclosing
    /// procedure, no fall-through.
    pub fn is_proc_terminator(&self, id: u16) -> bool {
        self.well_known.return_ == Some(id)
            || self.well_known.terminate_this_script == Some(id)
            || self.well_known.end_thread == Some(id)
    }

    /// Any command after which a new basic block must start.
    pub fn ends_block(&self, id: u16) -> bool {
        self.is_unconditional_branch(id)
            || self.is_conditional_branch(id)
            || self.is_proc_terminator(id)
    }

    /// `GOSUB` / `GOSUB_FILE`: calls into a procedure and returns.
    pub fn is_call(&self, id: u16) -> bool {
        self.well_known.gosub == Some(id) || self.well_known.gosub_file == Some(id)
    }

    /// `START_NEW_SCRIPT` / `LAUNCH_MISSION`: spawns a concurrent script at
    /// a label operand.
    pub fn is_label_spawn(&self, id: u16) -> bool {
        self.well_known.start_new_script == Some(id)
            || self.well_known.launch_mission == Some(id)
    }

    /// `LOAD_AND_LAUNCH_MISSION`: spawns a mission segment by index.
    pub fn is_mission_spawn(&self, id: u16) -> bool {
        self.well_known.load_and_launch_mission == Some(id)
    }

    pub fn is_switch_start(&self, id: u16) -> bool {
        self.well_known.switch_start == Some(id)
    }

    pub fn is_switch_continued(&self, id: u16) -> bool {
        self.well_known.switch_continued == Some(id)
    }

    pub fn is_script_name(&self, id: u16) -> bool {
        self.well_known.script_name == Some(id)
    }

    /// Role of a spawning command, used when typing procedure entries.
    pub fn gosub(&self) -> Option<u16> {
        self.well_known.gosub
    }

    pub fn gosub_file(&self) -> Option<u16> {
        self.well_known.gosub_file
    }

    pub fn start_new_script(&self) -> Option<u16> {
        self.well_known.start_new_script
    }

    pub fn launch_mission(&self) -> Option<u16> {
        self.well_known.launch_mission
    }

    pub fn load_and_launch_mission(&self) -> Option<u16> {
        self.well_known.load_and_launch_mission
    }

    /// Built-in table covering the well-known commands.
    ///
    /// Embedders targeting a specific engine revision should load the full
    /// table from data instead; this subset is enough for the analyzer and
    /// the tests.
    pub fn default_table() -> Self {
        use ArgType::*;

        fn def(id: u16, name: &str, args: Vec<ArgSchema>) -> CommandDef {
            CommandDef {
                id,
                name: name.to_string(),
                args,
            }
        }

        Self::new(vec![
            def(0x0000, "NOP", vec![]),
            def(0x0001, "WAIT", vec![ArgSchema::required(Int)]),
            def(0x0002, "GOTO", vec![ArgSchema::required(Label)]),
            def(
                0x0004,
                "SET_VAR_INT",
                vec![ArgSchema::required(Var), ArgSchema::required(Int)],
            ),
            def(
                0x0005,
                "SET_VAR_FLOAT",
                vec![ArgSchema::required(Var), ArgSchema::required(Float)],
            ),
            def(
                0x0006,
                "SET_LVAR_INT",
                vec![ArgSchema::required(Var), ArgSchema::required(Int)],
            ),
            def(
                0x0007,
                "SET_LVAR_FLOAT",
                vec![ArgSchema::required(Var), ArgSchema::required(Float)],
            ),
            def(0x004D, "GOTO_IF_FALSE", vec![ArgSchema::required(Label)]),
            def(0x004E, "TERMINATE_THIS_SCRIPT", vec![]),
            def(
                0x004F,
                "START_NEW_SCRIPT",
                vec![ArgSchema::required(Label), ArgSchema::repeated(Any)],
            ),
            def(0x0050, "GOSUB", vec![ArgSchema::required(Label)]),
            def(0x0051, "RETURN", vec![]),
            def(0x00D6, "ANDOR", vec![ArgSchema::required(Int)]),
            def(0x00D7, "LAUNCH_MISSION", vec![ArgSchema::required(Label)]),
            def(0x03A4, "SCRIPT_NAME", vec![ArgSchema::required(String)]),
            def(
                0x0417,
                "LOAD_AND_LAUNCH_MISSION",
                vec![ArgSchema::required(Int)],
            ),
            def(
                0x0871,
                "SWITCH_START",
                vec![
                    ArgSchema::required(Var),
                    ArgSchema::required(Int),
                    ArgSchema::required(Int),
                    ArgSchema::required(Label),
                    ArgSchema::repeated(Int),
                    ArgSchema::repeated(Label),
                ],
            ),
            def(
                0x0872,
                "SWITCH_CONTINUED",
                vec![ArgSchema::repeated(Int), ArgSchema::repeated(Label)],
            ),
        ])
    }
}
