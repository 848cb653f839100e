//! H.264 Annex B inspection
//!
//! Software encoders do not report the QP they picked, so it is read back
//! from the slice headers: `26 + pic_init_qp_minus26 + slice_qp_delta`.
//! Parameter sets are remembered across access units because P frames
//! reference the SPS/PPS sent with the last IDR.

use std::collections::HashMap;

const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

/// Profiles whose SPS carries chroma format and scaling lists
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// NAL units of an Annex B byte stream, start codes stripped
pub struct AnnexBNalus<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> AnnexBNalus<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let offset = find_start_code(data, 0).map_or(data.len(), |(_, end)| end);
        Self { data, offset }
    }
}

impl<'a> Iterator for AnnexBNalus<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let start = self.offset;
        let (end, next) = match find_start_code(self.data, start) {
            Some((code_start, code_end)) => (code_start, code_end),
            None => (self.data.len(), self.data.len()),
        };
        self.offset = next;
        // trailing_zero_8bits belong to no NAL
        let mut nal = &self.data[start..end];
        while let [rest @ .., 0] = nal {
            nal = rest;
        }
        if nal.is_empty() {
            return self.next();
        }
        Some(nal)
    }
}

/// Position of the next `00 00 01` at or after `from`: (start, end)
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return Some((i, i + 3));
        }
        i += 1;
    }
    None
}

/// Strip emulation prevention bytes (`00 00 03` -> `00 00`)
pub fn nal_to_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &byte in nal {
        if zeros >= 2 && byte == 3 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// MSB-first reader with Exp-Golomb codes
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    pub fn read_flag(&mut self) -> Option<bool> {
        self.read_bit().map(|b| b == 1)
    }

    pub fn read_bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    pub fn skip_bits(&mut self, count: u32) -> Option<()> {
        self.read_bits(count).map(|_| ())
    }

    pub fn read_ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(zeros)?;
        Some(((1u64 << zeros) - 1 + suffix as u64) as u32)
    }

    pub fn read_se(&mut self) -> Option<i32> {
        let k = self.read_ue()? as i64;
        let value = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        Some(value as i32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sps {
    separate_colour_plane: bool,
    log2_max_frame_num: u32,
    pic_order_cnt_type: u32,
    log2_max_poc_lsb: u32,
    delta_pic_order_always_zero: bool,
    frame_mbs_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pps {
    sps_id: u32,
    entropy_coding_mode: bool,
    bottom_field_pic_order_in_frame_present: bool,
    weighted_pred: bool,
    weighted_bipred_idc: u32,
    pic_init_qp: i32,
    redundant_pic_cnt_present: bool,
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

fn parse_sps(rbsp: &[u8]) -> Option<(u32, Sps)> {
    let mut r = BitReader::new(rbsp);
    let profile_idc = r.read_bits(8)? as u8;
    r.skip_bits(16)?; // constraint flags, level_idc
    let id = r.read_ue()?;

    let mut separate_colour_plane = false;
    if HIGH_PROFILES.contains(&profile_idc) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_flag()?;
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.skip_bits(1)?;
        if r.read_flag()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_flag()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let log2_max_frame_num = r.read_ue()? + 4;
    let pic_order_cnt_type = r.read_ue()?;
    let mut log2_max_poc_lsb = 0;
    let mut delta_pic_order_always_zero = false;
    match pic_order_cnt_type {
        0 => log2_max_poc_lsb = r.read_ue()? + 4,
        1 => {
            delta_pic_order_always_zero = r.read_flag()?;
            r.read_se()?;
            r.read_se()?;
            let cycle = r.read_ue()?;
            for _ in 0..cycle {
                r.read_se()?;
            }
        }
        _ => {}
    }
    r.read_ue()?; // max_num_ref_frames
    r.skip_bits(1)?;
    r.read_ue()?; // pic_width_in_mbs_minus1
    r.read_ue()?; // pic_height_in_map_units_minus1
    let frame_mbs_only = r.read_flag()?;

    Some((
        id,
        Sps {
            separate_colour_plane,
            log2_max_frame_num,
            pic_order_cnt_type,
            log2_max_poc_lsb,
            delta_pic_order_always_zero,
            frame_mbs_only,
        },
    ))
}

fn parse_pps(rbsp: &[u8]) -> Option<(u32, Pps)> {
    let mut r = BitReader::new(rbsp);
    let id = r.read_ue()?;
    let sps_id = r.read_ue()?;
    let entropy_coding_mode = r.read_flag()?;
    let bottom_field_pic_order_in_frame_present = r.read_flag()?;
    if r.read_ue()? != 0 {
        // Slice groups (FMO) are never produced by the encoders used here
        return None;
    }
    r.read_ue()?;
    r.read_ue()?;
    let weighted_pred = r.read_flag()?;
    let weighted_bipred_idc = r.read_bits(2)?;
    let pic_init_qp = 26 + r.read_se()?;
    r.read_se()?; // pic_init_qs_minus26
    r.read_se()?; // chroma_qp_index_offset
    r.skip_bits(2)?; // deblocking control, constrained intra
    let redundant_pic_cnt_present = r.read_flag()?;

    Some((
        id,
        Pps {
            sps_id,
            entropy_coding_mode,
            bottom_field_pic_order_in_frame_present,
            weighted_pred,
            weighted_bipred_idc,
            pic_init_qp,
            redundant_pic_cnt_present,
        },
    ))
}

fn skip_ref_pic_list_modification(r: &mut BitReader<'_>) -> Option<()> {
    if r.read_flag()? {
        loop {
            match r.read_ue()? {
                3 => break,
                0..=2 => {
                    r.read_ue()?;
                }
                _ => return None,
            }
        }
    }
    Some(())
}

fn skip_dec_ref_pic_marking(r: &mut BitReader<'_>, idr: bool) -> Option<()> {
    if idr {
        return r.skip_bits(2);
    }
    if r.read_flag()? {
        loop {
            let op = r.read_ue()?;
            if op == 0 {
                break;
            }
            if matches!(op, 1 | 3) {
                r.read_ue()?;
            }
            if op == 2 {
                r.read_ue()?;
            }
            if matches!(op, 3 | 6) {
                r.read_ue()?;
            }
            if op == 4 {
                r.read_ue()?;
            }
        }
    }
    Some(())
}

/// Reads slice QPs out of a stream of encoded access units
#[derive(Debug, Default)]
pub struct SliceQpReader {
    sps: HashMap<u32, Sps>,
    pps: HashMap<u32, Pps>,
}

impl SliceQpReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average slice QP of one access unit; `None` without a parsable slice
    pub fn frame_qp(&mut self, access_unit: &[u8]) -> Option<u32> {
        let mut total = 0u32;
        let mut slices = 0u32;
        for nal in AnnexBNalus::new(access_unit) {
            let header = nal[0];
            let nal_type = header & 0x1f;
            let rbsp = nal_to_rbsp(&nal[1..]);
            match nal_type {
                NAL_SPS => {
                    if let Some((id, sps)) = parse_sps(&rbsp) {
                        self.sps.insert(id, sps);
                    }
                }
                NAL_PPS => {
                    if let Some((id, pps)) = parse_pps(&rbsp) {
                        self.pps.insert(id, pps);
                    }
                }
                NAL_SLICE | NAL_IDR => {
                    let ref_idc = (header >> 5) & 0x3;
                    if let Some(qp) = self.slice_qp(&rbsp, nal_type == NAL_IDR, ref_idc) {
                        total += qp;
                        slices += 1;
                    }
                }
                _ => {}
            }
        }
        (slices > 0).then(|| (total + slices / 2) / slices)
    }

    fn slice_qp(&self, rbsp: &[u8], idr: bool, ref_idc: u8) -> Option<u32> {
        let mut r = BitReader::new(rbsp);
        r.read_ue()?; // first_mb_in_slice
        let slice_type = r.read_ue()? % 5;
        let pps = self.pps.get(&r.read_ue()?)?;
        let sps = self.sps.get(&pps.sps_id)?;
        let (is_p, is_b, is_i) = (
            matches!(slice_type, 0 | 3),
            slice_type == 1,
            matches!(slice_type, 2 | 4),
        );

        if sps.separate_colour_plane {
            r.skip_bits(2)?;
        }
        r.skip_bits(sps.log2_max_frame_num)?;
        let mut field_pic = false;
        if !sps.frame_mbs_only {
            field_pic = r.read_flag()?;
            if field_pic {
                r.skip_bits(1)?;
            }
        }
        if idr {
            r.read_ue()?; // idr_pic_id
        }
        if sps.pic_order_cnt_type == 0 {
            r.skip_bits(sps.log2_max_poc_lsb)?;
            if pps.bottom_field_pic_order_in_frame_present && !field_pic {
                r.read_se()?;
            }
        }
        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero {
            r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present && !field_pic {
                r.read_se()?;
            }
        }
        if pps.redundant_pic_cnt_present {
            r.read_ue()?;
        }
        if is_b {
            r.skip_bits(1)?; // direct_spatial_mv_pred_flag
        }
        if (is_p || is_b) && r.read_flag()? {
            r.read_ue()?;
            if is_b {
                r.read_ue()?;
            }
        }
        if !is_i {
            skip_ref_pic_list_modification(&mut r)?;
            if is_b {
                skip_ref_pic_list_modification(&mut r)?;
            }
        }
        if (pps.weighted_pred && is_p) || (pps.weighted_bipred_idc == 1 && is_b) {
            // pred_weight_table is never emitted by the encoders used here
            return None;
        }
        if ref_idc != 0 {
            skip_dec_ref_pic_marking(&mut r, idr)?;
        }
        if pps.entropy_coding_mode && !is_i {
            r.read_ue()?; // cabac_init_idc
        }
        let qp = pps.pic_init_qp + r.read_se()?;
        (0..=51).contains(&qp).then_some(qp as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct BitWriter {
        bytes: Vec<u8>,
        bits: usize,
    }

    impl BitWriter {
        fn bit(&mut self, bit: u32) -> &mut Self {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            if bit != 0 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bits % 8);
            }
            self.bits += 1;
            self
        }

        fn bits(&mut self, value: u32, count: u32) -> &mut Self {
            for i in (0..count).rev() {
                self.bit((value >> i) & 1);
            }
            self
        }

        fn ue(&mut self, value: u32) -> &mut Self {
            let code = value + 1;
            let len = 32 - code.leading_zeros();
            self.bits(0, len - 1).bits(code, len)
        }

        fn se(&mut self, value: i32) -> &mut Self {
            let mapped = if value > 0 {
                2 * value as u32 - 1
            } else {
                (-2 * value) as u32
            };
            self.ue(mapped)
        }

        /// rbsp_trailing_bits, then a NAL with start code
        fn nal(&mut self, header: u8) -> Vec<u8> {
            self.bit(1);
            while self.bits % 8 != 0 {
                self.bit(0);
            }
            let mut out = vec![0, 0, 0, 1, header];
            out.extend_from_slice(&self.bytes);
            out
        }
    }

    fn sps() -> Vec<u8> {
        BitWriter::default()
            .bits(66, 8)
            .bits(0xc0, 8)
            .bits(31, 8)
            .ue(0) // sps id
            .ue(0) // log2_max_frame_num_minus4
            .ue(2) // pic_order_cnt_type
            .ue(1)
            .bit(0)
            .ue(3)
            .ue(3)
            .bit(1) // frame_mbs_only
            .bit(1)
            .bit(0)
            .bit(0)
            .nal(0x67)
    }

    fn pps(pic_init_qp_minus26: i32) -> Vec<u8> {
        BitWriter::default()
            .ue(0)
            .ue(0)
            .bit(0) // CAVLC
            .bit(0)
            .ue(0)
            .ue(0)
            .ue(0)
            .bit(0)
            .bits(0, 2)
            .se(pic_init_qp_minus26)
            .se(0)
            .se(0)
            .bit(1)
            .bit(0)
            .bit(0)
            .nal(0x68)
    }

    fn idr_slice(qp_delta: i32) -> Vec<u8> {
        BitWriter::default()
            .ue(0)
            .ue(7) // I, all slices
            .ue(0)
            .bits(0, 4) // frame_num
            .ue(0) // idr_pic_id
            .bit(0)
            .bit(0)
            .se(qp_delta)
            .bits(0b1011, 4)
            .nal(0x65)
    }

    fn p_slice(qp_delta: i32) -> Vec<u8> {
        BitWriter::default()
            .ue(0)
            .ue(5) // P, all slices
            .ue(0)
            .bits(1, 4)
            .bit(0) // num_ref_idx_active_override_flag
            .bit(1) // ref_pic_list_modification_flag_l0
            .ue(0)
            .ue(0)
            .ue(3)
            .bit(1) // adaptive_ref_pic_marking_mode_flag
            .ue(1)
            .ue(0)
            .ue(0)
            .se(qp_delta)
            .bits(0b11, 2)
            .nal(0x41)
    }

    #[test]
    fn test_exp_golomb() {
        let data = BitWriter::default()
            .ue(0)
            .ue(1)
            .ue(254)
            .se(-3)
            .se(4)
            .nal(0x01);
        let mut r = BitReader::new(&data[5..]);
        assert_eq!(r.read_ue(), Some(0));
        assert_eq!(r.read_ue(), Some(1));
        assert_eq!(r.read_ue(), Some(254));
        assert_eq!(r.read_se(), Some(-3));
        assert_eq!(r.read_se(), Some(4));
    }

    #[test]
    fn test_emulation_prevention_removed() {
        assert_eq!(nal_to_rbsp(&[0x00, 0x00, 0x03, 0x01, 0x07]), vec![0, 0, 1, 7]);
        assert_eq!(nal_to_rbsp(&[0x00, 0x00, 0x03]), vec![0, 0]);
        assert_eq!(nal_to_rbsp(&[0x00, 0x03, 0x00]), vec![0, 3, 0]);
    }

    #[test]
    fn test_nal_split() {
        let stream = [0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4, 0];
        let nalus: Vec<&[u8]> = AnnexBNalus::new(&stream).collect();
        assert_eq!(
            nalus,
            vec![&[0x67, 1, 2][..], &[0x68, 3][..], &[0x65, 4][..]]
        );
    }

    #[test]
    fn test_slice_qp_across_access_units() {
        let mut reader = SliceQpReader::new();
        // No parameter sets yet
        assert_eq!(reader.frame_qp(&p_slice(0)), None);

        let mut idr = sps();
        idr.extend(pps(-4));
        idr.extend(idr_slice(2));
        assert_eq!(reader.frame_qp(&idr), Some(24));

        // P frames reuse the remembered parameter sets
        assert_eq!(reader.frame_qp(&p_slice(6)), Some(28));

        let mut two_slices = p_slice(-2);
        two_slices.extend(p_slice(2));
        assert_eq!(reader.frame_qp(&two_slices), Some(22));
    }

    #[test]
    fn test_garbage_has_no_qp() {
        let mut reader = SliceQpReader::new();
        assert_eq!(reader.frame_qp(&[]), None);
        assert_eq!(reader.frame_qp(&[0, 0, 1, 0x65]), None);
        assert_eq!(reader.frame_qp(&[1, 2, 3, 4, 5]), None);
    }
}
