#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Instant;

    use rstest::rstest;
    use tempfile::NamedTempFile;

    use crate::{
        analysis::{analyze, Analysis, AnalysisConfig},
        decoder::Z80Decoder,
        format::OutputFormat,
        image::{load_file, tests::amsdos_file, ByteImage, ImageFormat},
        region::{Classification, DataSignature},
        strategy::{Strategy, WorkOrder},
        Address, AddressStatus, Decoder,
    };

    const BASE: Address = 0x4000;

    /// A small game-shaped program: main loop, a jump table dispatched through
    /// `JP (HL)`, a message string, firmware calls, and zero-filled gaps.
    fn game_image() -> ByteImage {
        let mut bytes = vec![0u8; 0x400];
        let mut put = |addr: Address, code: &[u8]| {
            let off = (addr - BASE) as usize;
            bytes[off..off + code.len()].copy_from_slice(code);
        };

        put(0x4000, &[
            0x31, 0xff, 0xbf, // LD SP,&BFFF
            0xcd, 0x00, 0x41, // CALL &4100
            0xcd, 0x00, 0x42, // loop: CALL &4200
            0xcd, 0x00, 0x43, // CALL &4300
            0xcd, 0x06, 0xbb, // CALL &BB06 (KM WAIT CHAR)
            0xfe, 0x20,       // CP &20
            0x20, 0xf3,       // JR NZ,loop
            0x21, 0x23, 0x40, // LD HL,&4023
            0x3a, 0x50, 0x40, // LD A,(&4050)
            0x87,             // ADD A,A
            0x5f,             // LD E,A
            0x16, 0x00,       // LD D,0
            0x19,             // ADD HL,DE
            0x7e,             // LD A,(HL)
            0x23,             // INC HL
            0x66,             // LD H,(HL)
            0x6f,             // LD L,A
            0xe9,             // JP (HL)
        ]);
        // Dispatch table
        put(0x4023, &[0x00, 0x41, 0x00, 0x42, 0x00, 0x43]);
        // reset: XOR A ; LD (&4050),A ; RET
        put(0x4029, &[0xaf, 0x32, 0x50, 0x40, 0xc9]);
        put(0x402e, b"PRESS SPACE");
        // message: LD HL,&402E ; LD A,(HL) ; CALL &BB5A ; RET
        put(0x4039, &[0x21, 0x2e, 0x40, 0x7e, 0xcd, 0x5a, 0xbb, 0xc9]);
        // init
        put(0x4100, &[0xcd, 0x29, 0x40, 0xcd, 0x39, 0x40, 0xcd, 0x00, 0x43, 0xc9]);
        // update
        put(0x4200, &[
            0x3a, 0x50, 0x40, // LD A,(&4050)
            0x3c,             // INC A
            0x32, 0x50, 0x40, // LD (&4050),A
            0xfe, 0x03,       // CP 3
            0xc0,             // RET NZ
            0xcd, 0x29, 0x40, // CALL &4029
            0xc9,             // RET
        ]);
        // draw
        put(0x4300, &[
            0xdd, 0x21, 0x00, 0xc0, // LD IX,&C000
            0x06, 0x08,             // LD B,8
            0xdd, 0x36, 0x00, 0xff, // LD (IX+0),&FF
            0xdd, 0x23,             // INC IX
            0x10, 0xf8,             // DJNZ &4306
            0xc9,                   // RET
        ]);

        ByteImage::new(BASE, bytes).unwrap()
    }

    fn run(image: &ByteImage, config: &AnalysisConfig) -> Analysis {
        let start = Instant::now();
        let analysis = analyze(image, &Z80Decoder::new(), config).unwrap();
        println!(
            "{} in {:?}: {} instructions, {} subroutines",
            config.strategy,
            start.elapsed(),
            analysis.flow.instruction_count(),
            analysis.call_graph.len()
        );
        analysis
    }

    fn recursive(order: WorkOrder, seeds: Vec<Address>) -> Analysis {
        let config = AnalysisConfig {
            seeds,
            order,
            ..AnalysisConfig::default()
        };
        run(&game_image(), &config)
    }

    #[test]
    fn test_game_call_graph() {
        let analysis = recursive(WorkOrder::BreadthFirst, vec![BASE]);
        let graph = &analysis.call_graph;

        let freq: Vec<_> = graph.by_frequency().iter().map(|s| (s.entry, s.call_count())).collect();
        assert_eq!(
            freq,
            vec![
                (0x4029, 2),
                (0x4300, 2),
                (0x4039, 1),
                (0x4100, 1),
                (0x4200, 1),
                (0xbb06, 1),
                (0xbb5a, 1),
            ]
        );
        assert_eq!(graph.get(0x4300).unwrap().call_sites, vec![0x4009, 0x4106]);
        assert_eq!(graph.get(0x4029).unwrap().call_sites, vec![0x4100, 0x420a]);
        assert_eq!(graph.get(0x4200).unwrap().first_return, Some(0x420d));
        assert_eq!(graph.get(0x4300).unwrap().first_return, Some(0x430e));
        assert!(graph.get(0xbb06).unwrap().external);

        assert_eq!(graph.unresolved().len(), 1);
        assert_eq!(graph.unresolved()[0].site, 0x4022);
        assert_eq!(analysis.diagnostics.unresolved_targets, 1);
        assert_eq!(analysis.diagnostics.external_targets, 2);
        assert!(analysis.diagnostics.invalid_opcodes.is_empty());
    }

    #[test]
    fn test_game_regions() {
        let analysis = recursive(WorkOrder::BreadthFirst, vec![BASE]);

        let spans: Vec<_> = analysis
            .regions
            .regions()
            .iter()
            .map(|r| (r.start, r.end, r.class, r.evidence.and_then(|e| e.signature)))
            .collect();
        let code = Classification::Code;
        let data = Classification::Data;
        assert_eq!(
            spans,
            vec![
                (0x4000, 0x4023, code, None),
                (0x4023, 0x4029, data, Some(DataSignature::PointerTable)),
                (0x4029, 0x402e, code, None),
                (0x402e, 0x4039, data, Some(DataSignature::Text)),
                (0x4039, 0x4041, code, None),
                (0x4041, 0x4100, data, Some(DataSignature::Fill)),
                (0x4100, 0x410a, code, None),
                (0x410a, 0x4200, data, Some(DataSignature::Fill)),
                (0x4200, 0x420e, code, None),
                (0x420e, 0x4300, data, Some(DataSignature::Fill)),
                (0x4300, 0x430f, code, None),
                (0x430f, 0x4400, data, Some(DataSignature::Fill)),
            ]
        );
        assert_eq!(analysis.diagnostics.code_bytes, 87);
        assert_eq!(analysis.diagnostics.unknown_bytes, 0);
    }

    #[rstest]
    fn test_order_independence(
        #[values(WorkOrder::BreadthFirst, WorkOrder::DepthFirst)] order: WorkOrder,
    ) {
        let reference = recursive(WorkOrder::BreadthFirst, vec![BASE]);
        // Extra seeds that are reached anyway must not change anything
        let other = recursive(order, vec![0x4300, 0x4029, BASE]);

        let image = game_image();
        assert_eq!(reference.flow.coverage(&image), other.flow.coverage(&image));
        assert_eq!(
            reference.flow.instructions.keys().collect::<Vec<_>>(),
            other.flow.instructions.keys().collect::<Vec<_>>()
        );
        assert_eq!(reference.flow.edges, other.flow.edges);
        assert_eq!(reference.call_graph.edges(), other.call_graph.edges());
        assert_eq!(reference.regions.regions(), other.regions.regions());
    }

    #[rstest]
    fn test_coverage_and_conservation(
        #[values(Strategy::Recursive, Strategy::Linear)] strategy: Strategy,
    ) {
        let image = game_image();
        let config = AnalysisConfig {
            strategy,
            ..AnalysisConfig::default()
        };
        let analysis = run(&image, &config);

        let regions = analysis.regions.regions();
        assert_eq!(regions.first().unwrap().start, image.base());
        assert_eq!(regions.last().unwrap().end, image.end());
        for pair in regions.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap at 0x{:04x}", pair[0].end);
        }
        let per_class: usize = regions.iter().map(|r| r.len()).sum();
        assert_eq!(per_class, image.len());
        assert_eq!(analysis.diagnostics.total_bytes(), image.len());
    }

    #[rstest]
    fn test_call_graph_consistency(
        #[values(Strategy::Recursive, Strategy::Linear)] strategy: Strategy,
    ) {
        let config = AnalysisConfig {
            strategy,
            ..AnalysisConfig::default()
        };
        let analysis = run(&game_image(), &config);
        let graph = &analysis.call_graph;

        for edge in graph.edges() {
            assert!(graph.get(edge.target).is_some(), "dangling edge to 0x{:04x}", edge.target);
        }
        for sub in graph.subroutines() {
            assert!(sub.call_count() >= 1);
            let incoming = graph.edges().iter().filter(|e| e.target == sub.entry).count();
            assert_eq!(incoming, sub.call_count());
            assert!(sub.call_sites.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_idempotent_decode() {
        let image = game_image();
        let decoder = Z80Decoder::new();
        let analysis = recursive(WorkOrder::DepthFirst, vec![BASE]);

        for (&addr, insn) in &analysis.flow.instructions {
            assert_eq!(&decoder.decode(&image, addr).unwrap(), insn);
            assert_eq!(decoder.decode(&image, addr), decoder.decode(&image, addr));
        }

        let config = AnalysisConfig {
            verify: true,
            ..AnalysisConfig::default()
        };
        assert!(run(&image, &config).diagnostics.verification_mismatches.is_empty());
    }

    #[test]
    fn test_linear_sweep_sees_more_code() {
        let image = game_image();
        let rec = run(&image, &AnalysisConfig::default());
        let lin = run(
            &image,
            &AnalysisConfig {
                strategy: Strategy::Linear,
                ..AnalysisConfig::default()
            },
        );

        assert!(lin.flow.instruction_count() > rec.flow.instruction_count());
        assert!(lin.diagnostics.code_bytes > rec.diagnostics.code_bytes);
        // Every byte is either swept as code or rejected
        assert!(lin
            .flow
            .coverage(&image)
            .iter()
            .all(|s| matches!(s, AddressStatus::Code | AddressStatus::Undecodable)));
    }

    #[test]
    fn test_amsdos_file_round_trip() {
        let image = game_image();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&amsdos_file(0x4000, 0x4000, image.bytes())).unwrap();
        file.flush().unwrap();

        let loaded = load_file(file.path(), None).unwrap();
        assert_eq!(loaded.format, ImageFormat::Amsdos);
        assert_eq!(loaded.image, image);
        assert_eq!(loaded.entry_point, Some(0x4000));

        let config = AnalysisConfig {
            seeds: loaded.entry_point.into_iter().collect(),
            ..AnalysisConfig::default()
        };
        let from_file = run(&loaded.image, &config);
        let direct = recursive(WorkOrder::BreadthFirst, vec![BASE]);
        assert_eq!(from_file.call_graph.edges(), direct.call_graph.edges());

        // An explicit base forces a raw load, header and all
        let raw = load_file(file.path(), Some(0x100)).unwrap();
        assert_eq!(raw.format, ImageFormat::Raw);
        assert_eq!(raw.image.len(), image.len() + 128);
    }

    #[test]
    fn test_all_formats_render() {
        let image = game_image();
        let analysis = recursive(WorkOrder::BreadthFirst, vec![BASE]);

        for format in OutputFormat::available_formats() {
            let output = format.get_formatter().format(&analysis, &image).unwrap();
            println!("{}: {} bytes", format, output.len());
            assert!(!output.is_empty());
        }

        let json = OutputFormat::Json.get_formatter().format(&analysis, &image).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["subroutines"].as_array().unwrap().len(), 7);
        assert_eq!(parsed["regions"].as_array().unwrap().len(), 12);

        let listing = OutputFormat::Listing.get_formatter().format(&analysis, &image).unwrap();
        assert!(listing.contains("L4029:                          ; called 2 time(s)"));
        assert!(listing.contains("; ---- data (pointer table) &4023-&4028 ----"));
        assert!(listing.contains(";   &4022 jump"));
    }
}
