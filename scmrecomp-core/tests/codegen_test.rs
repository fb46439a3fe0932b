//! Integration tests for code generation

use scmrecomp_core::recompiler::analysis::{
    compute_dominators, find_basic_blocks, find_call_edges, find_edges, find_natural_loops,
    sort_natural_loops,
};
use scmrecomp_core::recompiler::codegen::CodeGeneratorIA32;
use scmrecomp_core::recompiler::commands::Commands;
use scmrecomp_core::recompiler::disassembler::Disassembler;
use scmrecomp_core::recompiler::error::RecompilerError;
use scmrecomp_core::recompiler::header::Version;
use scmrecomp_core::recompiler::pipeline::{HostParams, RecompilationPipeline};
use scmrecomp_core::recompiler::structure::{
    mark_break_continue, structure_conditionals, structure_dowhile, to_statements,
};

const RTL_WAIT: u32 = 0x7000;
const RTL_TERMINATE: u32 = 0x7100;

fn analyzed<'a>(bytes: &'a [u8], commands: &'a Commands) -> Disassembler<'a> {
    let mut disasm = Disassembler::new_main(bytes, commands);
    disasm.run_analyzer();
    disasm.disassembly();
    disasm
}

fn codegen_for<'a>(
    commands: &'a Commands,
    disasm: &'a Disassembler<'a>,
) -> CodeGeneratorIA32<'a> {
    let mut codegen = CodeGeneratorIA32::new(commands, disasm.get_data());
    codegen.register_extern("DYNAREC_RTL_Wait", RTL_WAIT);
    codegen.register_extern("DYNAREC_RTL_TerminateThisScript", RTL_TERMINATE);
    codegen
}

#[test]
fn wait_call_pushes_and_cleans_up_on_ia32() {
    let commands = Commands::default_table();
    let bytes = [
        0x01, 0x00, 0x01, 0xF4, 0x01, 0x00, 0x00, // WAIT 500
        0x4E, 0x00, // TERMINATE_THIS_SCRIPT
    ];
    let disasm = analyzed(&bytes, &commands);
    let mut codegen = codegen_for(&commands, &disasm);
    codegen.generate_all().unwrap();
    codegen.link().unwrap();
    let code = codegen.encode(0).unwrap();

    // push 500; push ebp (running thread); call; add esp, 8.
    assert_eq!(&code[..5], &[0x68, 0xF4, 0x01, 0x00, 0x00]);
    assert_eq!(code[5], 0x55);
    assert_eq!(code[6], 0xE8);
    let rel = i32::from_le_bytes(code[7..11].try_into().unwrap());
    assert_eq!(rel, RTL_WAIT as i32 - 11, "call displacement targets the import");
    assert_eq!(&code[11..13], &[0x81, 0xC4]);
    assert_eq!(&code[13..17], &8u32.to_le_bytes());
}

#[test]
fn forward_goto_allocates_patchable_label() {
    let commands = Commands::default_table();
    let bytes = [
        0x02, 0x00, 0x01, 0x09, 0x00, 0x00, 0x00, // 0: GOTO 9
        0xEE, 0xEE, // 7: junk
        0x4E, 0x00, // 9: TERMINATE_THIS_SCRIPT
    ];
    let disasm = analyzed(&bytes, &commands);
    let mut codegen = codegen_for(&commands, &disasm);
    codegen.generate_all().unwrap();

    assert_eq!(codegen.num_labels(), 1, "one pc label for the branch key");
    let size = codegen.link().expect("the later label definition binds it");
    let code = codegen.encode(0).unwrap();
    assert_eq!(code.len(), size);

    // jmp field at [1..5): target is the 16-aligned label position.
    let rel = i32::from_le_bytes(code[1..5].try_into().unwrap());
    assert_eq!(rel, 16 - 5, "GOTO emission pads to a 16-byte boundary");
}

#[test]
fn label_never_defined_fails_link() {
    let commands = Commands::default_table();
    // Branch target lands in bytes that never decode; the label key is
    // allocated but nothing binds it.
    let bytes = [
        0x02, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, // GOTO 8
        0xEE, 0xEE, 0xEE, 0xEE, 0xEE,
    ];
    let disasm = analyzed(&bytes, &commands);
    let mut codegen = codegen_for(&commands, &disasm);
    codegen.generate_all().unwrap();
    assert!(matches!(
        codegen.link(),
        Err(RecompilerError::UnboundLabel(_))
    ));
}

#[test]
fn structured_loop_emits_linkable_code() {
    let commands = Commands::default_table();
    let bytes = [
        0x4D, 0x00, 0x01, 0x2A, 0x00, 0x00, 0x00, // H1  0: GOTO_IF_FALSE 42
        0x4D, 0x00, 0x01, 0x1C, 0x00, 0x00, 0x00, // H2  7: GOTO_IF_FALSE 28
        0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // T2 14: WAIT 0
        0x02, 0x00, 0x01, 0x07, 0x00, 0x00, 0x00, //    21: GOTO 7
        0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // T1 28: WAIT 0
        0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, //    35: GOTO 0
        0x4E, 0x00, // E 42: TERMINATE_THIS_SCRIPT
    ];
    let disasm = analyzed(&bytes, &commands);
    let mut block_list = find_basic_blocks(&commands, &disasm, &[]);
    find_edges(&mut block_list, &commands);
    find_call_edges(&mut block_list, &commands).unwrap();
    compute_dominators(&mut block_list);
    let mut loops = find_natural_loops(&block_list);
    sort_natural_loops(&block_list, &mut loops);

    let (mut tree, entry) = to_statements(&block_list, 0);
    let entry = structure_dowhile(&mut tree, entry, &loops).unwrap();
    let entry = structure_conditionals(&mut tree, &block_list, &commands, entry);
    mark_break_continue(&mut tree, &block_list, &commands);

    let mut codegen = codegen_for(&commands, &disasm);
    codegen
        .generate_statements(&block_list, &tree, entry)
        .unwrap();
    let size = codegen.link().expect("all loop labels must be bound");
    let code = codegen.encode(0).unwrap();
    assert_eq!(code.len(), size);
    assert!(size > 0);

    // The emitted code ends with the terminate call and ret.
    assert_eq!(*code.last().unwrap(), 0xC3);
}

#[test]
fn pipeline_recompiles_a_full_image() {
    fn sled(target: u32) -> Vec<u8> {
        let mut bytes = vec![0x02, 0x00, 0x01];
        bytes.extend_from_slice(&target.to_le_bytes());
        bytes
    }

    let commands = Commands::default_table();

    // Header: globals (sled + 1 pad), one model name, empty mission table.
    let seg2 = 8u32;
    let seg3 = seg2 + 7 + 4 + 24;
    let code_start = seg3 + 7 + 4 + 4;

    let mut image = sled(seg2);
    image.push(0x00);
    image.extend_from_slice(&sled(seg3));
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&[0u8; 24]);
    image.extend_from_slice(&sled(code_start));
    let main_size_pos = image.len();
    image.extend_from_slice(&0u32.to_le_bytes()); // main size, patched below
    image.extend_from_slice(&0u32.to_le_bytes()); // no missions
    assert_eq!(image.len() as u32, code_start);

    image.extend_from_slice(&[0x01, 0x00, 0x01, 0xF4, 0x01, 0x00, 0x00]); // WAIT 500
    image.extend_from_slice(&[0x4E, 0x00]); // TERMINATE_THIS_SCRIPT
    let main_size = image.len() as u32;
    image[main_size_pos..main_size_pos + 4].copy_from_slice(&main_size.to_le_bytes());

    let host = HostParams {
        globals_base: 0x2000,
        code_base: 0x10000,
        externs: &[
            ("DYNAREC_RTL_Wait", RTL_WAIT),
            ("DYNAREC_RTL_TerminateThisScript", RTL_TERMINATE),
        ],
    };

    let output =
        RecompilationPipeline::recompile(&image, Version::Liberty, &commands, &host).unwrap();

    assert_eq!(output.header.main_size, main_size);
    assert_eq!(output.header.mission_offsets.len(), 0);
    assert_eq!(output.stats.mission_segments, 0);
    assert!(output.stats.blocks >= 4, "three header sleds plus the code");
    assert_eq!(output.stats.code_size, output.code.len());
    assert!(!output.code.is_empty());
    // The terminate call's ret is somewhere near the end (alignment pads may
    // follow depending on emission order).
    assert!(output.code.contains(&0xC3));
}
