//! Recompilation Pipeline
//!
//! Orchestrates the complete run from a raw script image to encoded machine
//! code:
//! 1. **Header decode**: versioned SCM header, mission table.
//! 2. **Segment split**: one fetcher per mission, main segment bounded by
//!    the declared main size.
//! 3. **Analysis**: exploration of every segment; mission references into
//!    the main segment are fed back before materialization.
//! 4. **Flow reconstruction**: block list, edges, call/spawn
//!    cross-references, dominators, natural loops.
//! 5. **Structuring**: per-procedure statement trees with loops and
//!    conditionals reduced.
//! 6. **Code generation**: the main segment's procedures, emitted through
//!    the statement trees, then linked and encoded.

use crate::recompiler::analysis::{
    compute_dominators, find_basic_blocks, find_call_edges, find_edges, find_natural_loops,
    sort_natural_loops, SegType,
};
use crate::recompiler::codegen::CodeGeneratorIA32;
use crate::recompiler::commands::Commands;
use crate::recompiler::disassembler::Disassembler;
use crate::recompiler::error::ProgramContext;
use crate::recompiler::header::{mission_segment_fetcher, ScmHeader, Version};
use crate::recompiler::structure::{
    mark_break_continue, structure_conditionals, structure_dowhile, to_statements,
};
use anyhow::{bail, Context, Result};

/// Statistics collected during a pipeline run.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PipelineStats {
    pub mission_segments: usize,
    pub blocks: usize,
    pub procedures: usize,
    pub natural_loops: usize,
    pub advisories: usize,
    pub code_size: usize,
}

/// Result of a pipeline run.
pub struct PipelineOutput {
    pub header: ScmHeader,
    pub code: Vec<u8>,
    pub stats: PipelineStats,
}

/// Host-side parameters of a recompilation.
pub struct HostParams<'h> {
    /// Address of the global-variable storage.
    pub globals_base: u32,
    /// Address the emitted code will be loaded at.
    pub code_base: u32,
    /// Resolved runtime imports.
    pub externs: &'h [(&'h str, u32)],
}

pub struct RecompilationPipeline;

impl RecompilationPipeline {
    /// Recompiles a script image into native code for the main segment.
    pub fn recompile(
        bytecode: &[u8],
        version: Version,
        commands: &Commands,
        host: &HostParams<'_>,
    ) -> Result<PipelineOutput> {
        let mut program = ProgramContext::new();

        log::info!("step 1: decoding SCM header");
        let header =
            ScmHeader::from_bytecode(bytecode, version).context("failed to decode SCM header")?;

        let main_size = header.main_size as usize;
        if main_size > bytecode.len() {
            bail!(
                "main segment size {} exceeds image size {}",
                main_size,
                bytecode.len()
            );
        }
        let main_bytes = &bytecode[..main_size];

        log::info!(
            "step 2: splitting {} mission segment(s)",
            header.mission_offsets.len()
        );
        let mission_fetchers = mission_segment_fetcher(bytecode, &header, &mut program);

        log::info!("step 3: analyzing segments");
        let mut main_disasm = Disassembler::new_main(main_bytes, commands);
        main_disasm.run_analyzer();

        let mut mission_disasms: Vec<Disassembler<'_>> = mission_fetchers
            .iter()
            .map(|fetcher| {
                let mut disasm =
                    Disassembler::new_mission(fetcher.bytes(), commands, header.main_size);
                disasm.run_analyzer();
                disasm
            })
            .collect();

        // Mission references into the main segment must be explored before
        // the main segment materializes.
        let cross_refs: Vec<u32> = mission_disasms
            .iter()
            .flat_map(|m| m.cross_segment_refs())
            .collect();
        for offset in cross_refs {
            main_disasm.add_external_label(offset);
        }

        main_disasm.disassembly();
        for mission in &mut mission_disasms {
            mission.disassembly();
        }
        program.extend(main_disasm.advisories().iter().cloned());
        for mission in &mission_disasms {
            program.extend(mission.advisories().iter().cloned());
        }

        log::info!("step 4: reconstructing control flow");
        let mut block_list = find_basic_blocks(commands, &main_disasm, &mission_disasms);
        find_edges(&mut block_list, commands);
        find_call_edges(&mut block_list, commands)
            .context("call graph reconstruction failed")?;
        compute_dominators(&mut block_list);

        let mut loops = find_natural_loops(&block_list);
        sort_natural_loops(&block_list, &mut loops);
        log::info!(
            "found {} block(s), {} procedure(s), {} natural loop(s)",
            block_list.non_dummy_blocks.1,
            block_list.proc_entries.len(),
            loops.len()
        );

        log::info!("step 5: structuring and emitting the main segment");
        let mut codegen = CodeGeneratorIA32::new(commands, main_disasm.get_data());
        codegen.set_globals_base(host.globals_base);
        for &(name, address) in host.externs {
            codegen.register_extern(name, address);
        }

        let main_procs: Vec<usize> = (0..block_list.proc_entries.len())
            .filter(|&p| {
                let entry = block_list.proc_entries[p].block_id;
                block_list.block(entry).block_begin.segtype == SegType::Main
            })
            .collect();

        for proc_id in main_procs {
            let entry_block = block_list.proc_entries[proc_id].block_id;
            let (mut tree, entry) = to_statements(&block_list, entry_block);
            let entry = structure_dowhile(&mut tree, entry, &loops)
                .context("loop structuring failed")?;
            let entry = structure_conditionals(&mut tree, &block_list, commands, entry);
            mark_break_continue(&mut tree, &block_list, commands);
            codegen
                .generate_statements(&block_list, &tree, entry)
                .with_context(|| format!("emission of procedure {proc_id} failed"))?;
        }

        // Mission segments need their own generator instance each; only the
        // main segment is emitted here.
        if !mission_disasms.is_empty() {
            log::debug!("mission segment emission is driven by the embedder");
        }

        log::info!("step 6: linking");
        let code_size = codegen.link().context("unresolved labels at link time")?;
        let code = codegen.encode(host.code_base)?;

        let stats = PipelineStats {
            mission_segments: mission_disasms.len(),
            blocks: block_list.non_dummy_blocks.1,
            procedures: block_list.proc_entries.len(),
            natural_loops: loops.len(),
            advisories: program.advisories().len(),
            code_size,
        };

        Ok(PipelineOutput {
            header,
            code,
            stats,
        })
    }
}
