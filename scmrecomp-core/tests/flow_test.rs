//! Integration tests for flow reconstruction and structuring

use scmrecomp_core::recompiler::analysis::{
    compute_dominators, find_basic_blocks, find_call_edges, find_edges, find_natural_loops,
    sort_natural_loops, BlockList, ProcType, SegType,
};
use scmrecomp_core::recompiler::commands::Commands;
use scmrecomp_core::recompiler::disassembler::Disassembler;
use scmrecomp_core::recompiler::structure::{
    structure_conditionals, structure_dowhile, to_statements, StatementKind,
};

fn analyzed<'a>(bytes: &'a [u8], commands: &'a Commands) -> Disassembler<'a> {
    let mut disasm = Disassembler::new_main(bytes, commands);
    disasm.run_analyzer();
    disasm.disassembly();
    disasm
}

fn doms(block_list: &BlockList<'_>, block: usize) -> Vec<usize> {
    block_list.blocks[block].dominators.iter_ones().collect()
}

#[test]
fn diamond_produces_if_else_with_join_dominators() {
    let commands = Commands::default_table();
    let bytes = [
        0x4D, 0x00, 0x01, 0x0E, 0x00, 0x00, 0x00, // A  0: GOTO_IF_FALSE 14
        0x02, 0x00, 0x01, 0x15, 0x00, 0x00, 0x00, // B  7: GOTO 21
        0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // C 14: WAIT 0
        0x4E, 0x00, // D 21: TERMINATE_THIS_SCRIPT
    ];
    let disasm = analyzed(&bytes, &commands);
    let mut block_list = find_basic_blocks(&commands, &disasm, &[]);
    find_edges(&mut block_list, &commands);
    compute_dominators(&mut block_list);

    assert_eq!(doms(&block_list, 3), vec![0, 3], "dom(D) = {{A, D}}");

    let (mut tree, entry) = to_statements(&block_list, 0);
    let entry = structure_conditionals(&mut tree, &block_list, &commands, entry);

    let StatementKind::IfElse { cond, .. } = tree.node(entry).kind else {
        panic!("the diamond must reduce to a single IfElse");
    };
    assert_eq!(tree.statement_of_block(0), Some(cond), "A is the condition");
    assert_eq!(
        tree.node(entry).succ.len(),
        1,
        "the join is the IfElse's sole successor"
    );
}

#[test]
fn back_edge_reduces_to_while() {
    let commands = Commands::default_table();
    let bytes = [
        0x4D, 0x00, 0x01, 0x15, 0x00, 0x00, 0x00, // H  0: GOTO_IF_FALSE 21
        0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // T  7: WAIT 0
        0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, //   14: GOTO 0
        0x4E, 0x00, // E 21: TERMINATE_THIS_SCRIPT
    ];
    let disasm = analyzed(&bytes, &commands);
    let mut block_list = find_basic_blocks(&commands, &disasm, &[]);
    find_edges(&mut block_list, &commands);
    compute_dominators(&mut block_list);

    let mut loops = find_natural_loops(&block_list);
    sort_natural_loops(&block_list, &mut loops);
    assert_eq!(loops.len(), 1);
    assert_eq!((loops[0].head, loops[0].tail), (0, 1));

    let (mut tree, entry) = to_statements(&block_list, 0);
    let head = tree.statement_of_block(0).unwrap();
    let tail = tree.statement_of_block(1).unwrap();
    let entry = structure_dowhile(&mut tree, entry, &loops).unwrap();

    assert!(
        matches!(tree.node(entry).kind, StatementKind::While { .. }),
        "the loop head was the entry, so the While takes its place"
    );
    assert_eq!(
        tree.node(head).pred.as_slice(),
        &[tail],
        "only the back edge still reaches the head"
    );
    let StatementKind::Block { trim_until, .. } = tree.node(tail).kind else {
        panic!("tail must stay a block");
    };
    assert_eq!(trim_until, 1, "the back-jump is elided from emission");
}

#[test]
fn nested_loops_sort_inner_first_and_nest_after_reduction() {
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
    compute_dominators(&mut block_list);

    let mut loops = find_natural_loops(&block_list);
    sort_natural_loops(&block_list, &mut loops);

    assert_eq!(loops.len(), 2);
    // Blocks: H1=0, H2=1, T2=2, T1=3, E=4. Inner (head H2) sorts first.
    assert_eq!((loops[0].head, loops[0].tail), (1, 2));
    assert_eq!((loops[1].head, loops[1].tail), (0, 3));
    assert!(
        block_list.blocks[loops[0].head].dominated_by(loops[1].head),
        "the inner head is dominated by the outer head"
    );

    let (mut tree, entry) = to_statements(&block_list, 0);
    let outer_head = tree.statement_of_block(0).unwrap();
    let entry = structure_dowhile(&mut tree, entry, &loops).unwrap();

    // The entry was the outer head, so the outer While replaces it.
    let StatementKind::While { head, .. } = tree.node(entry).kind else {
        panic!("outer loop must reduce to a While at the entry");
    };
    assert_eq!(head, outer_head);

    // The outer head's loop-side successor is the inner While.
    let inner = tree.node(outer_head).succ[1];
    assert!(
        matches!(tree.node(inner).kind, StatementKind::While { .. }),
        "the inner While becomes the body of the outer While"
    );
}

#[test]
fn gosub_and_spawn_cross_references() {
    let commands = Commands::default_table();

    let mut main: Vec<u8> = Vec::new();
    main.extend_from_slice(&[0x50, 0x00, 0x01]); // GOSUB
    let gosub_target_pos = main.len();
    main.extend_from_slice(&[0, 0, 0, 0]);
    main.extend_from_slice(&[0x4F, 0x00, 0x01]); // START_NEW_SCRIPT
    let spawn_target_pos = main.len();
    main.extend_from_slice(&[0, 0, 0, 0]);
    main.push(0x00); // end of variadic list
    main.extend_from_slice(&[0x17, 0x04, 0x04, 0x00]); // LOAD_AND_LAUNCH_MISSION 0
    main.extend_from_slice(&[0x4E, 0x00]); // TERMINATE_THIS_SCRIPT
    let gosub_target = main.len() as u32;
    main.extend_from_slice(&[0x51, 0x00]); // RETURN
    let spawn_target = main.len() as u32;
    main.extend_from_slice(&[0x4E, 0x00]); // TERMINATE_THIS_SCRIPT
    main[gosub_target_pos..gosub_target_pos + 4]
        .copy_from_slice(&gosub_target.to_le_bytes());
    main[spawn_target_pos..spawn_target_pos + 4]
        .copy_from_slice(&spawn_target.to_le_bytes());

    let mission_bytes = [0x4E, 0x00]; // TERMINATE_THIS_SCRIPT

    let main_disasm = analyzed(&main, &commands);
    let mut mission = Disassembler::new_mission(&mission_bytes, &commands, main.len() as u32);
    mission.run_analyzer();
    mission.disassembly();
    let missions = vec![mission];

    let mut block_list = find_basic_blocks(&commands, &main_disasm, &missions);
    find_edges(&mut block_list, &commands);
    find_call_edges(&mut block_list, &commands).unwrap();

    // Main + gosub proc + spawned script + the mission segment.
    assert_eq!(block_list.proc_entries.len(), 4);

    let main_proc = block_list.proc_entries.iter().position(|p| p.proc_type.contains(ProcType::MAIN)).unwrap();
    let gosub_proc = block_list.proc_entries.iter().position(|p| p.proc_type.contains(ProcType::GOSUB)).unwrap();
    let script_proc = block_list.proc_entries.iter().position(|p| p.proc_type.contains(ProcType::SCRIPT)).unwrap();
    let mission_proc = block_list.proc_entries.iter().position(|p| p.proc_type.contains(ProcType::MISSION)).unwrap();

    assert_eq!(block_list.proc_entries[main_proc].calls_into.len(), 1);
    assert_eq!(
        block_list.proc_entries[main_proc].calls_into[0].proc_id,
        gosub_proc
    );
    assert_eq!(block_list.proc_entries[gosub_proc].called_from.len(), 1);

    // Both spawn styles record spawner and spawned.
    let spawned: Vec<usize> = block_list.proc_entries[main_proc]
        .spawns_script
        .iter()
        .map(|x| x.proc_id)
        .collect();
    assert!(spawned.contains(&script_proc));
    assert!(spawned.contains(&mission_proc));
    assert_eq!(block_list.proc_entries[mission_proc].spawned_from.len(), 1);

    // The mission segment's entry block belongs to the mission range.
    let mission_entry = block_list.proc_entries[mission_proc].block_id;
    assert_eq!(
        block_list.blocks[mission_entry].block_begin.segtype,
        SegType::Mission
    );
}

#[test]
fn mission_branch_into_main_segment_links_blocks() {
    let commands = Commands::default_table();
    let main_bytes = [
        0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // 0: WAIT 0
        0x4E, 0x00, // 7: TERMINATE_THIS_SCRIPT
    ];
    let mission_bytes = [
        0x02, 0x00, 0x01, 0xF9, 0xFF, 0xFF, 0xFF, // GOTO -7
    ];

    let mut main = Disassembler::new_main(&main_bytes, &commands);
    main.run_analyzer();
    let mut mission =
        Disassembler::new_mission(&mission_bytes, &commands, main_bytes.len() as u32);
    mission.run_analyzer();
    for offset in mission.cross_segment_refs().collect::<Vec<_>>() {
        main.add_external_label(offset);
    }
    main.disassembly();
    mission.disassembly();
    let missions = vec![mission];

    let mut block_list = find_basic_blocks(&commands, &main, &missions);
    find_edges(&mut block_list, &commands);

    // The mission's only block jumps straight into main's second block.
    let (mission_start, mission_end) = block_list.mission_blocks[0];
    assert_eq!(mission_end - mission_start, 1);
    let succ = &block_list.blocks[mission_start].succ;
    assert_eq!(succ.len(), 1);
    assert_eq!(
        block_list.blocks[succ[0]].block_begin.segtype,
        SegType::Main,
        "negative label offsets reference the main segment"
    );
}
