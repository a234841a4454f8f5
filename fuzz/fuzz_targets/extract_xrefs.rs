#![no_main]
use libfuzzer_sys::fuzz_target;
use xrefscan::analysis::memory::ImageMemory;
use xrefscan::analysis::translate::AddressTranslator;
use xrefscan::analysis::xrefs::{scan_window, ClassFilter, ClassSentinels};
use xrefscan::core::reference::XrefKind;
use xrefscan::disasm::iced::IcedDecoder;
use xrefscan::{BinaryImage, CodeAddress, XrefRecord};

const BASE: u64 = 0x1_8000_0000;

fuzz_target!(|data: &[u8]| {
    xrefscan::logging::init(xrefscan::logging::LogFormat::Pretty, "error");

    // The input is both the code window and the memory the filter reads.
    let image = BinaryImage::from_bytes(data.to_vec());
    let memory = ImageMemory::new(&image, AddressTranslator::new(BASE));
    let start = CodeAddress::mapped(BASE);
    let end = BASE + data.len() as u64;
    let d = IcedDecoder::new();

    let open = scan_window(&d, data, start, ClassFilter::Skip, false);
    let open = match &open {
        Ok(Ok(records)) => records.as_slice(),
        _ => &[],
    };
    for r in open {
        assert!(r.found_at.value >= BASE && r.found_at.value < end);
    }

    // Sentinels point into the input so some loads pass the check.
    let sentinels = ClassSentinels::new(BASE + 0x10, BASE + 0x20);
    let filter = ClassFilter::check(&memory, sentinels);
    if let Ok(Ok(checked)) = scan_window(&d, data, start, filter, false) {
        for r in checked.iter().filter(|r| r.kind == XrefKind::Global) {
            assert!(filter.accepts(r.target.value));
        }
        // Filtering only drops globals.
        let methods = |rs: &[XrefRecord]| rs.iter().filter(|r| r.kind == XrefKind::Method).count();
        assert_eq!(methods(&checked), methods(open));
    }
});
