#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use crate::buffer::Buffer;
    use crate::decoder::CapstoneDecoder;
    use crate::engine::{transform, Engine};
    use crate::strategy::{ArchFilter, Registry, RunContext, Scorer, Strategy};
    use crate::{Architecture, BadByteSet, EngineError, Insn};

    /// Test strategy that rewrites every mov with fixed bytes.
    struct Fixed {
        name: &'static str,
        priority: i32,
        arch: ArchFilter,
        bytes: Vec<u8>,
        declared_size: usize,
    }

    impl Fixed {
        fn boxed(name: &'static str, priority: i32, bytes: Vec<u8>) -> Arc<dyn Strategy> {
            let declared_size = bytes.len();
            Arc::new(Fixed {
                name,
                priority,
                arch: ArchFilter::Any,
                bytes,
                declared_size,
            })
        }
    }

    impl Strategy for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn arch(&self) -> ArchFilter {
            self.arch
        }
        fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
            insn.mnemonic == "mov"
        }
        fn max_size(&self, _insn: &Insn) -> usize {
            self.declared_size
        }
        fn generate(&self, _insn: &Insn, _ctx: &mut RunContext, out: &mut Buffer) {
            out.append(&self.bytes);
        }
    }

    fn decode(arch: Architecture, bytes: &[u8]) -> Vec<Insn> {
        CapstoneDecoder::for_architecture(arch)
            .unwrap()
            .decode_all(bytes, 0)
            .unwrap()
    }

    #[rstest]
    #[case::x86(Architecture::X86, vec![0xb8, 0x00, 0x10, 0x00, 0x00, 0xc3])]
    #[case::x64(Architecture::X64, vec![0x48, 0xc7, 0xc0, 0x00, 0x10, 0x00, 0x00, 0xc3])]
    #[case::arm(Architecture::Arm, vec![0x00, 0x00, 0xa0, 0xe3, 0x1e, 0xff, 0x2f, 0xe1])]
    #[case::arm64(Architecture::Arm64, vec![0x00, 0x00, 0x80, 0x52, 0xc0, 0x03, 0x5f, 0xd6])]
    fn test_register_load_scenarios(#[case] arch: Architecture, #[case] payload: Vec<u8>) {
        let bad = BadByteSet::default();
        let clean = transform(&payload, arch, &bad, None).unwrap();

        // Cleanliness: no forbidden byte anywhere in the output
        assert!(bad.is_clean(&clean), "unclean output for {}", arch);
        assert!(!clean.is_empty());

        // The output must still be a decodable instruction stream
        let insns = decode(arch, &clean);
        assert!(!insns.is_empty());

        // Idempotence: a clean result passes through unchanged
        let again = transform(&clean, arch, &bad, None).unwrap();
        assert_eq!(again, clean, "already-clean output was rewritten ({})", arch);
    }

    #[test]
    fn test_x86_scenario_preserves_load_value() {
        // mov eax, 0x1000 — three nulls in the immediate
        let payload = [0xb8, 0x00, 0x10, 0x00, 0x00];
        let clean = transform(&payload, Architecture::X86, &BadByteSet::default(), None).unwrap();

        // The rewrite is a mov/xor immediate pair; the loaded value must
        // survive the reconstruction.
        let insns = decode(Architecture::X86, &clean);
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].mnemonic, "mov");
        assert_eq!(insns[1].mnemonic, "xor");

        let (reg_a, a) = insns[0].reg_imm().unwrap();
        let (reg_b, b) = insns[1].reg_imm().unwrap();
        assert_eq!(reg_a.name, "eax");
        assert_eq!(reg_b.name, "eax");
        assert_eq!((a as u32) ^ (b as u32), 0x1000);
    }

    #[test]
    fn test_determinism() {
        let payload = [0xb8, 0x00, 0x10, 0x00, 0x00, 0x31, 0xdb, 0xc3];
        let bad = BadByteSet::default();

        let first = transform(&payload, Architecture::X86, &bad, None).unwrap();
        let second = transform(&payload, Architecture::X86, &bad, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_length_accounting() {
        let engine = Engine::new(Architecture::X86, BadByteSet::default()).unwrap();
        let result = engine
            .run(&[0xb8, 0x00, 0x10, 0x00, 0x00, 0x90, 0xc3])
            .unwrap();

        assert_eq!(result.report.output_len, result.bytes.len());
        let rewritten: usize = result.report.rewrites.iter().map(|r| r.new_len).sum();
        let kept: usize = result.report.input_len
            - result
                .report
                .rewrites
                .iter()
                .map(|r| r.orig_len)
                .sum::<usize>();
        assert_eq!(rewritten + kept, result.bytes.len());
    }

    #[test]
    fn test_priority_wins() {
        let mut registry = Registry::new();
        registry.register(Fixed::boxed("low", 10, vec![0x90]));
        registry.register(Fixed::boxed("high", 50, vec![0x91, 0x91]));

        let engine = Engine::new(Architecture::X86, BadByteSet::default())
            .unwrap()
            .with_registry(registry);
        let result = engine.run(&[0xb8, 0x00, 0x10, 0x00, 0x00, 0xc3]).unwrap();

        assert_eq!(result.bytes, vec![0x91, 0x91, 0xc3]);
        assert_eq!(result.report.rewrites[0].strategy, "high");
    }

    #[test]
    fn test_equal_priority_first_registered_wins() {
        let mut registry = Registry::new();
        registry.register(Fixed::boxed("first", 10, vec![0x90]));
        registry.register(Fixed::boxed("second", 10, vec![0x91]));

        let engine = Engine::new(Architecture::X86, BadByteSet::default())
            .unwrap()
            .with_registry(registry);
        let result = engine.run(&[0xb8, 0x00, 0x10, 0x00, 0x00, 0xc3]).unwrap();

        assert_eq!(result.bytes, vec![0x90, 0xc3]);
        assert_eq!(result.report.rewrites[0].strategy, "first");
    }

    #[test]
    fn test_scorer_breaks_ties_only() {
        struct Prefer(&'static str);
        impl Scorer for Prefer {
            fn score(&self, _insn: &Insn, strategy: &str) -> f64 {
                if strategy == self.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }

        let mut registry = Registry::new();
        registry.register(Fixed::boxed("first", 10, vec![0x90]));
        registry.register(Fixed::boxed("second", 10, vec![0x91]));

        let engine = Engine::new(Architecture::X86, BadByteSet::default())
            .unwrap()
            .with_registry(registry)
            .with_scorer(Box::new(Prefer("second")));
        let result = engine.run(&[0xb8, 0x00, 0x10, 0x00, 0x00, 0xc3]).unwrap();

        assert_eq!(result.bytes, vec![0x91, 0xc3]);
    }

    #[test]
    fn test_size_contract_violation_is_fatal() {
        struct Liar;
        impl Strategy for Liar {
            fn name(&self) -> &'static str {
                "liar"
            }
            fn priority(&self) -> i32 {
                10
            }
            fn applies(&self, insn: &Insn, _ctx: &RunContext) -> bool {
                insn.mnemonic == "mov"
            }
            fn max_size(&self, _insn: &Insn) -> usize {
                1
            }
            fn generate(&self, _insn: &Insn, _ctx: &mut RunContext, out: &mut Buffer) {
                out.append(&[0x90, 0x90, 0x90]);
            }
        }

        let mut registry = Registry::new();
        registry.register(Arc::new(Liar));

        let engine = Engine::new(Architecture::X86, BadByteSet::default())
            .unwrap()
            .with_registry(registry);
        let err = engine.run(&[0xb8, 0x00, 0x10, 0x00, 0x00]).unwrap_err();

        assert!(matches!(
            err,
            EngineError::SizeContractViolation { strategy: "liar" }
        ));
    }

    #[test]
    fn test_unresolved_is_reported_not_passed_through() {
        // Only an ARM-scoped strategy is registered: the dirty x86 mov has
        // zero eligible candidates and must surface in the failure, never
        // silently flow into the output.
        let mut registry = Registry::new();
        registry.register(Arc::new(Fixed {
            name: "arm_only",
            priority: 10,
            arch: ArchFilter::Only(Architecture::Arm),
            bytes: vec![0x90],
            declared_size: 1,
        }));

        let engine = Engine::new(Architecture::X86, BadByteSet::default())
            .unwrap()
            .with_registry(registry);
        let err = engine.run(&[0x90, 0xb8, 0x00, 0x10, 0x00, 0x00, 0xc3]).unwrap_err();

        match err {
            EngineError::UnresolvedInstructions { offsets } => assert_eq!(offsets, vec![1]),
            other => panic!("expected UnresolvedInstructions, got {:?}", other),
        }
    }

    #[test]
    fn test_relocation_tracks_rewritten_lengths() {
        // jmp over a dirty mov to the ret: the mov grows from 5 to 11
        // bytes, so the jmp displacement must move from 5 to 11.
        let payload = [0xeb, 0x05, 0xb8, 0x00, 0x10, 0x00, 0x00, 0xc3];
        let bad = BadByteSet::default();
        let clean = transform(&payload, Architecture::X86, &bad, None).unwrap();

        assert!(bad.is_clean(&clean));
        assert_eq!(clean.len(), 14);
        assert_eq!(clean[0], 0xeb);
        assert_eq!(clean[1], 0x0b);
        assert_eq!(*clean.last().unwrap(), 0xc3);

        // The branch still lands on the ret
        let insns = decode(Architecture::X86, &clean);
        assert_eq!(insns[0].rel_target(), Some(13));
        assert_eq!(insns.last().unwrap().mnemonic, "ret");
        assert_eq!(insns.last().unwrap().addr, 13);
    }

    #[test]
    fn test_branch_widens_when_displacement_byte_is_bad() {
        // Profile forbidding 0x0d: the short `je +0x0d` itself carries a
        // bad displacement byte and must escape to the near form, while
        // the mov immediate is rebuilt to dodge 0x0d.
        let bad = BadByteSet::from_bytes(&[0x0d]);
        let mut payload = vec![
            0x74, 0x0d, // je +0x0d (target = 15)
            0xb8, 0x00, 0x00, 0x00, 0x0d, // mov eax, 0x0d000000
        ];
        payload.extend_from_slice(&[0x90; 8]); // offsets 7..15
        payload.push(0xc3); // target at 15

        let clean = transform(&payload, Architecture::X86, &bad, None).unwrap();
        assert!(bad.is_clean(&clean));

        // je widened to the near form
        assert_eq!(&clean[..2], &[0x0f, 0x84]);
        let disp = i32::from_le_bytes(clean[2..6].try_into().unwrap());

        // ... and still lands on the ret
        let insns = decode(Architecture::X86, &clean);
        let target = (6 + disp) as u64;
        let ret = insns.iter().find(|i| i.mnemonic == "ret").unwrap();
        assert_eq!(ret.addr, target);
    }

    #[test]
    fn test_arm_branch_follows_growing_code() {
        // Forbid 0x91: the LDR offset form carries it in its third byte, so
        // the load is rebuilt as a three-word adjust/access/restore group
        // and the branch over it must stretch accordingly.
        let payload = [
            0x01, 0x00, 0x00, 0xea, // b +12 (orig end)
            0x00, 0x01, 0x91, 0xe5, // ldr r0, [r1, #0x100]
            0x01, 0x10, 0xa0, 0xe1, // mov r1, r1
        ];
        let bad = BadByteSet::from_bytes(&[0x91]);
        let clean = transform(&payload, Architecture::Arm, &bad, None).unwrap();

        assert!(bad.is_clean(&clean));
        assert_eq!(clean.len(), 20);
        // offset field now spans five words: (20 - 8) / 4 = 3
        assert_eq!(&clean[..4], &[0x03, 0x00, 0x00, 0xea]);
    }

    #[test]
    fn test_bounded_iteration_reports_failure() {
        // A single pass is not enough when the branch needs a second
        // selection round after relocation flags it.
        let bad = BadByteSet::from_bytes(&[0x0d]);
        let mut payload = vec![0x74, 0x0d, 0xb8, 0x00, 0x00, 0x00, 0x0d];
        payload.extend_from_slice(&[0x90; 8]);
        payload.push(0xc3);

        // Generous bound succeeds (see the widening test); bound of zero is
        // clamped to one pass and must either finish or report, never hang.
        let result = transform(&payload, Architecture::X86, &bad, Some(1));
        match result {
            Ok(bytes) => assert!(bad.is_clean(&bytes)),
            Err(EngineError::UnresolvedInstructions { offsets }) => assert!(!offsets.is_empty()),
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_multi_instruction_stream() {
        // A small x86 routine exercising several strategy families at once
        let payload = [
            0xb8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0          → xor
            0xbb, 0x05, 0x00, 0x00, 0x00, // mov ebx, 5          → push/pop
            0xb9, 0x00, 0x10, 0x00, 0x00, // mov ecx, 0x1000     → xor pair
            0x01, 0xd8, // add eax, ebx (clean)
            0xc3, // ret
        ];
        let bad = BadByteSet::default();
        let clean = transform(&payload, Architecture::X86, &bad, None).unwrap();

        assert!(bad.is_clean(&clean));
        let insns = decode(Architecture::X86, &clean);
        assert_eq!(insns.last().unwrap().mnemonic, "ret");

        // spot-check the chosen idioms
        assert_eq!(&clean[..2], &[0x31, 0xc0]); // xor eax, eax
        assert_eq!(&clean[2..5], &[0x6a, 0x05, 0x5b]); // push 5; pop ebx
    }
}
