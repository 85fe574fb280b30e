/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use bkasm::assembler::DefineValue;
use bkasm::ast::Syntax;
use bkasm::errors::AssemblyError;
use bkasm::file_reader::MockFileReader;
use bkasm::{ForcedFormat, Options, assemble_files, assemble_project};
use std::fs;
use std::path::PathBuf;

fn raw_options() -> Options {
    Options {
        forced_format: Some(ForcedFormat::Raw),
        ..Options::default()
    }
}

fn assemble_one(source: &str, options: &Options) -> Result<Vec<u8>, anyhow::Error> {
    let mut reader = MockFileReader::default();
    reader.add_file("main.mac", source);
    let outputs = assemble_files(&[PathBuf::from("main.mac")], options, &reader)?;
    Ok(outputs.files[0].1.clone())
}

fn assembly_error(err: &anyhow::Error) -> &AssemblyError {
    err.downcast_ref::<AssemblyError>()
        .expect("expected an assembly error")
}

#[test]
fn test_halt_image() {
    // Scenario A: HALT at link 01000.
    let bytes = assemble_one("HALT\n", &raw_options()).unwrap();
    assert_eq!(bytes, vec![0x00, 0x00]);
}

#[test]
fn test_immediate_mov_image() {
    // Scenario B: MOV #12345, R0 -> 012700 012345.
    let bytes = assemble_one("MOV #12345, R0\n", &raw_options()).unwrap();
    assert_eq!(bytes, vec![0xC0, 0x15, 0xE5, 0x14]);
}

#[test]
fn test_forward_branch_image() {
    // Scenario C: BR L, NOP, L: HALT -> BR word is 000401.
    let bytes = assemble_one("BR L\nNOP\nL: HALT\n", &raw_options()).unwrap();
    assert_eq!(bytes[0], 0x01); // 000401 low byte
    assert_eq!(bytes[1], 0x01); // 000401 high byte
    assert_eq!(&bytes[2..4], &[0xA0, 0x00]); // NOP = 000240
    assert_eq!(&bytes[4..6], &[0x00, 0x00]); // HALT
}

#[test]
fn test_duplicate_label_diagnostic() {
    // Scenario D: the error points at the second definition.
    let err = assemble_one("A: .WORD 1\nA: .WORD 2\n", &raw_options()).unwrap_err();
    let err = assembly_error(&err);
    let AssemblyError::Compiler { pos, reason } = err else {
        panic!("expected a compiler error, got {err:?}");
    };
    assert_eq!(reason, "Duplicate local label A");
    assert_eq!(pos.line, 2);
}

#[test]
fn test_repeat_unrolling_image() {
    // Scenario E: three iterations of X: .WORD 0.
    let bytes = assemble_one(".REPEAT 3 { X: .WORD 0 }\n", &raw_options()).unwrap();
    assert_eq!(bytes, vec![0; 6]);
}

#[test]
fn test_pc_relative_closure_backward() {
    // Invariant: emitted offset word is (expr - (pc + 2)) mod 65536.
    let bytes = assemble_one("L: HALT\nCLR L\n", &raw_options()).unwrap();
    // CLR at 01002, extra word at 01004: 01000 - 01006 = -6.
    assert_eq!(&bytes[4..6], &[0xFA, 0xFF]);
}

#[test]
fn test_include_stitches_files() {
    let mut reader = MockFileReader::default();
    reader.add_file("main.mac", ".WORD 1\n.INCLUDE \"sub/part.mac\"\n.WORD 3\n");
    reader.add_file("sub/part.mac", ".WORD 2\n");

    let outputs = assemble_files(&[PathBuf::from("main.mac")], &raw_options(), &reader).unwrap();
    assert_eq!(outputs.files[0].1, vec![1, 0, 2, 0, 3, 0]);
}

#[test]
fn test_include_paths_are_relative_to_includer() {
    let mut reader = MockFileReader::default();
    reader.add_file("src/main.mac", ".INCLUDE \"lib/io.mac\"\n");
    reader.add_file("src/lib/io.mac", ".INCLUDE \"koi8.mac\"\n.BYTE 2\n");
    reader.add_file("src/lib/koi8.mac", ".BYTE 1\n");

    let outputs =
        assemble_files(&[PathBuf::from("src/main.mac")], &raw_options(), &reader).unwrap();
    assert_eq!(outputs.files[0].1, vec![1, 2]);
}

#[test]
fn test_missing_include_is_reported() {
    let mut reader = MockFileReader::default();
    reader.add_file("main.mac", ".INCLUDE \"gone.mac\"\n");

    let err = assemble_files(&[PathBuf::from("main.mac")], &raw_options(), &reader).unwrap_err();
    let err = assembly_error(&err);
    assert!(err.to_string().contains("Error including gone.mac"));
}

#[test]
fn test_once_makes_double_include_idempotent() {
    let mut reader = MockFileReader::default();
    reader.add_file(
        "main.mac",
        ".INCLUDE \"lib.mac\"\n.INCLUDE \"lib.mac\"\n.WORD K\n",
    );
    reader.add_file("lib.mac", ".ONCE\n.EXTERN K\nK = 42\n.BYTE 1\n");

    let outputs = assemble_files(&[PathBuf::from("main.mac")], &raw_options(), &reader).unwrap();
    // Exactly one inclusion's worth of bytes, and K still resolves.
    assert_eq!(outputs.files[0].1, vec![1, 0o42, 0]);
}

#[test]
fn test_link_in_included_file_moves_only_link_pc() {
    let mut reader = MockFileReader::default();
    reader.add_file("main.mac", ".INCLUDE \"sub.mac\"\n.WORD 2\n");
    reader.add_file("sub.mac", ".LINK 4000\nX: .WORD X\n");

    let outputs = assemble_files(&[PathBuf::from("main.mac")], &raw_options(), &reader).unwrap();
    // X is defined at link address 04000 but written at 01000; the word
    // after the include continues at 01002.
    assert_eq!(outputs.files[0].1, vec![0x00, 0x08, 2, 0]);
}

#[test]
fn test_extern_labels_cross_files() {
    let mut reader = MockFileReader::default();
    reader.add_file("defs.mac", ".EXTERN VRAM\nVRAM = 40000\n");
    reader.add_file("main.mac", ".WORD VRAM\n");

    let outputs = assemble_files(
        &[PathBuf::from("defs.mac"), PathBuf::from("main.mac")],
        &raw_options(),
        &reader,
    )
    .unwrap();
    assert_eq!(outputs.files[0].1, vec![0x00, 0x40]);
}

#[test]
fn test_local_labels_do_not_cross_files() {
    let mut reader = MockFileReader::default();
    reader.add_file("defs.mac", "HIDDEN = 1\n");
    reader.add_file("main.mac", ".WORD HIDDEN\n");

    let err = assemble_files(
        &[PathBuf::from("defs.mac"), PathBuf::from("main.mac")],
        &raw_options(),
        &reader,
    )
    .unwrap_err();
    assert!(
        assembly_error(&err)
            .to_string()
            .contains("Label 'HIDDEN' not found")
    );
}

#[test]
fn test_extern_collision_diagnosed() {
    let mut reader = MockFileReader::default();
    reader.add_file("a.mac", ".EXTERN ALL\nK = 1\n");
    reader.add_file("b.mac", ".EXTERN ALL\nK = 2\n");

    let err = assemble_files(
        &[PathBuf::from("a.mac"), PathBuf::from("b.mac")],
        &raw_options(),
        &reader,
    )
    .unwrap_err();
    assert!(
        assembly_error(&err)
            .to_string()
            .contains("Duplicate global label K")
    );
}

#[test]
fn test_pdp11asm_at_displacement_is_verbatim() {
    let source = "CLR @100\n";
    let pdp11asm = Options {
        syntax: Syntax::Pdp11Asm,
        ..raw_options()
    };
    let bytes = assemble_one(source, &pdp11asm).unwrap();
    // The displacement word is the expression itself.
    assert_eq!(&bytes[2..4], &[0x40, 0x00]);

    let bytes = assemble_one(source, &raw_options()).unwrap();
    // pdpy11 resolves it PC-relative: 0100 - 01004 = -0704.
    let offset = (0o100i32 - 0o1004).rem_euclid(65536) as u16;
    assert_eq!(&bytes[2..4], &offset.to_le_bytes());
}

#[test]
fn test_cli_defines() {
    let options = Options {
        defines: vec![
            ("SPEED".to_string(), DefineValue::Int(0o177714)),
            ("GREETING".to_string(), DefineValue::Str("HI".to_string())),
        ],
        ..raw_options()
    };
    let bytes = assemble_one(".WORD SPEED\n", &options).unwrap();
    assert_eq!(bytes, vec![0xCC, 0xFF]);
}

#[test]
fn test_bin_container_has_load_header() {
    let options = Options {
        forced_format: Some(ForcedFormat::Bin),
        ..Options::default()
    };
    let bytes = assemble_one("HALT\n", &options).unwrap();
    // {link_lo, link_hi, len_lo, len_hi} then the image.
    assert_eq!(bytes, vec![0x00, 0x02, 0x02, 0x00, 0x00, 0x00]);
}

#[test]
fn test_make_bin_names_output_after_source() {
    let mut reader = MockFileReader::default();
    reader.add_file("game.mac", "make_bin\nHALT\n");

    let outputs =
        assemble_files(&[PathBuf::from("game.mac")], &Options::default(), &reader).unwrap();
    assert_eq!(outputs.files[0].0, PathBuf::from("game.bin"));
}

#[test]
fn test_forced_format_overrides_make_directives() {
    let mut reader = MockFileReader::default();
    reader.add_file("game.mac", "make_bin\nHALT\n");

    let outputs = assemble_files(&[PathBuf::from("game.mac")], &raw_options(), &reader).unwrap();
    // Raw output, no BIN header, default name without extension.
    assert_eq!(outputs.files.len(), 1);
    assert_eq!(outputs.files[0].0, PathBuf::from("game"));
    assert_eq!(outputs.files[0].1, vec![0x00, 0x00]);
}

#[test]
fn test_sav_container_layout() {
    let options = Options {
        forced_format: Some(ForcedFormat::Sav),
        ..Options::default()
    };
    let bytes = assemble_one("HALT\nHALT\n", &options).unwrap();
    assert_eq!(bytes.len(), 512 + 4);
    assert_eq!(&bytes[32..34], &0o1000u16.to_le_bytes());
    // Default final address is link + length.
    assert_eq!(&bytes[40..42], &0o1004u16.to_le_bytes());
}

#[test]
fn test_wav_outputs_are_riff() {
    for format in [ForcedFormat::Wav, ForcedFormat::TurboWav] {
        let options = Options {
            forced_format: Some(format),
            ..Options::default()
        };
        let bytes = assemble_one("HALT\n", &options).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
    }
}

#[test]
fn test_listing_is_emitted() {
    let options = Options {
        listing: true,
        ..raw_options()
    };
    let mut reader = MockFileReader::default();
    reader.add_file("main.mac", "START: HALT\nDONE: BR DONE\n");
    let outputs = assemble_files(&[PathBuf::from("main.mac")], &options, &reader).unwrap();

    let (path, text) = outputs.listing.expect("listing requested");
    assert_eq!(path, PathBuf::from("main.lst"));
    assert!(text.contains("001000 START"));
    assert!(text.contains("001002 DONE"));
}

#[test]
fn test_insert_file_appends_raw_bytes() {
    let mut reader = MockFileReader::default();
    reader.add_file("main.mac", "INSERT_FILE \"sprite.bin\"\n.BYTE 377\n");
    reader.add_binary_file("sprite.bin", &[1, 2, 3]);

    let outputs = assemble_files(&[PathBuf::from("main.mac")], &raw_options(), &reader).unwrap();
    assert_eq!(outputs.files[0].1, vec![1, 2, 3, 0xFF]);
}

#[test]
fn test_syntax_error_position_and_exit_path() {
    let err = assemble_one("MOV #, R0\n", &raw_options()).unwrap_err();
    let err = assembly_error(&err);
    let AssemblyError::Syntax { pos, .. } = err else {
        panic!("expected a syntax error, got {err:?}");
    };
    assert_eq!(pos.file, "main.mac");
    assert_eq!(pos.line, 1);
}

#[test]
fn test_org_in_root_rebases_the_image() {
    // In the include-root, ORG moves PC, link-PC and the image start, so
    // the image begins at the last origin.
    let bytes = assemble_one("ORG 1000\n.WORD 1\nORG 1010\n.WORD 2\n", &raw_options()).unwrap();
    assert_eq!(bytes, vec![2, 0]);
}

// ------------- project mode -------------

#[test]
fn test_project_mode_with_two_roots() {
    // Scenario F: two include-roots sharing one extern symbol.
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(
        root.join("one.mac"),
        "make_bin \"one.bin\"\n.INCLUDE \"shared.mac\"\n.WORD K\n",
    )
    .unwrap();
    fs::write(
        root.join("two.mac"),
        "make_bin \"two.bin\"\n.INCLUDE \"shared.mac\"\n.WORD K\nHALT\n",
    )
    .unwrap();
    fs::write(root.join("shared.mac"), ".ONCE\n.EXTERN K\nK = 1234\n").unwrap();

    let reader = bkasm::file_reader::AsmFileReader;
    let outputs = assemble_project(root, &Options::default(), &reader).unwrap();

    assert_eq!(outputs.files.len(), 2);
    let mut paths: Vec<String> = outputs
        .files
        .iter()
        .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["one.bin", "two.bin"]);

    // K resolves to the same value in both images (skip the BIN header).
    for (_, bytes) in &outputs.files {
        assert_eq!(&bytes[4..6], &0o1234u16.to_le_bytes());
    }
}

#[test]
fn test_project_ignore_file_filters_sources() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join(".pdpy11ignore"), "broken.mac\n").unwrap();
    fs::write(root.join("main.mac"), "make_raw \"out\"\nHALT\n").unwrap();
    // Would fail to parse if it were scanned.
    fs::write(root.join("broken.mac"), "@@@ not assembly @@@\n").unwrap();

    let reader = bkasm::file_reader::AsmFileReader;
    let outputs = assemble_project(root, &Options::default(), &reader).unwrap();
    assert_eq!(outputs.files.len(), 1);
    assert_eq!(outputs.files[0].1, vec![0x00, 0x00]);
}

#[test]
fn test_project_directory_include() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir(root.join("parts")).unwrap();
    fs::write(
        root.join("main.mac"),
        "make_raw \"out\"\n.INCLUDE \"parts\"\n",
    )
    .unwrap();
    fs::write(root.join("parts").join("a.mac"), ".BYTE 1\n").unwrap();
    fs::write(root.join("parts").join("b.mac"), ".BYTE 2\n").unwrap();

    let reader = bkasm::file_reader::AsmFileReader;
    let outputs = assemble_project(root, &Options::default(), &reader).unwrap();
    assert_eq!(outputs.files.len(), 1);
    // Directory includes pull in every .mac under it, sorted.
    assert_eq!(outputs.files[0].1, vec![1, 2]);
}
