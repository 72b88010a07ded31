//! H.264 slice QP extraction.
//!
//! Parses just enough of the sequence and picture parameter sets to walk a
//! slice header up to `slice_qp_delta`. Parameter sets persist across
//! access units because encoders only repeat them at IDRs.

use std::collections::HashMap;

use super::rbsp::{unescape, BitReader};
use super::{BitstreamError, NalUnit, NAL_IDR, NAL_PPS, NAL_SLICE, NAL_SPS};

const MAX_QP: i32 = 51;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceType {
    fn from_code(code: u32) -> Self {
        match code % 5 {
            0 => Self::P,
            1 => Self::B,
            2 => Self::I,
            3 => Self::Sp,
            _ => Self::Si,
        }
    }

    fn is_intra(self) -> bool {
        matches!(self, Self::I | Self::Si)
    }
}

/// Fields of a sequence parameter set that slice headers depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub id: u32,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    pub separate_colour_plane: bool,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_poc_lsb: u32,
    pub delta_pic_order_always_zero: bool,
    pub frame_mbs_only: bool,
    pub width_mbs: u32,
    pub height_map_units: u32,
}

impl Sps {
    fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane {
            0
        } else {
            self.chroma_format_idc
        }
    }
}

/// Fields of a picture parameter set that slice headers depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub id: u32,
    pub sps_id: u32,
    pub entropy_coding_mode: bool,
    pub bottom_field_pic_order_present: bool,
    pub num_ref_idx_l0_default: u32,
    pub num_ref_idx_l1_default: u32,
    pub weighted_pred: bool,
    pub weighted_bipred_idc: u32,
    pub pic_init_qp_minus26: i32,
    pub deblocking_filter_control_present: bool,
    pub redundant_pic_cnt_present: bool,
}

fn has_high_profile_fields(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), BitstreamError> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.se()?;
            next = (last + delta + 256).rem_euclid(256);
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// Parse an SPS payload (NAL header byte excluded, already unescaped).
///
/// # Errors
///
/// [`BitstreamError`] on truncation or out-of-range fields.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_sps(rbsp: &[u8]) -> Result<Sps, BitstreamError> {
    let mut r = BitReader::new(rbsp);
    let profile_idc = r.bits(8)? as u8;
    r.skip(8)?; // constraint flags
    let level_idc = r.bits(8)? as u8;
    let id = r.ue()?;
    if id > 31 {
        return Err(BitstreamError::Malformed("sps id out of range"));
    }

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if has_high_profile_fields(profile_idc) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.bit()?;
        }
        let _bit_depth_luma = r.ue()?;
        let _bit_depth_chroma = r.ue()?;
        let _qpprime_y_zero_transform_bypass = r.bit()?;
        if r.bit()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.bit()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let log2_max_frame_num = r.ue()? + 4;
    if log2_max_frame_num > 16 {
        return Err(BitstreamError::Malformed("log2_max_frame_num out of range"));
    }
    let pic_order_cnt_type = r.ue()?;
    let mut log2_max_poc_lsb = 0;
    let mut delta_pic_order_always_zero = false;
    match pic_order_cnt_type {
        0 => {
            log2_max_poc_lsb = r.ue()? + 4;
            if log2_max_poc_lsb > 16 {
                return Err(BitstreamError::Malformed("log2_max_poc_lsb out of range"));
            }
        }
        1 => {
            delta_pic_order_always_zero = r.bit()?;
            let _offset_for_non_ref_pic = r.se()?;
            let _offset_for_top_to_bottom_field = r.se()?;
            let cycle = r.ue()?;
            if cycle > 255 {
                return Err(BitstreamError::Malformed("poc cycle too long"));
            }
            for _ in 0..cycle {
                r.se()?;
            }
        }
        2 => {}
        _ => return Err(BitstreamError::Malformed("pic_order_cnt_type")),
    }

    let _max_num_ref_frames = r.ue()?;
    let _gaps_in_frame_num_allowed = r.bit()?;
    let width_mbs = r.ue()? + 1;
    let height_map_units = r.ue()? + 1;
    let frame_mbs_only = r.bit()?;

    Ok(Sps {
        id,
        profile_idc,
        level_idc,
        chroma_format_idc,
        separate_colour_plane,
        log2_max_frame_num,
        pic_order_cnt_type,
        log2_max_poc_lsb,
        delta_pic_order_always_zero,
        frame_mbs_only,
        width_mbs,
        height_map_units,
    })
}

/// Parse a PPS payload (NAL header byte excluded, already unescaped).
///
/// # Errors
///
/// [`BitstreamError::Unsupported`] for slice groups (FMO), otherwise
/// truncation or range errors.
pub fn parse_pps(rbsp: &[u8]) -> Result<Pps, BitstreamError> {
    let mut r = BitReader::new(rbsp);
    let id = r.ue()?;
    if id > 255 {
        return Err(BitstreamError::Malformed("pps id out of range"));
    }
    let sps_id = r.ue()?;
    let entropy_coding_mode = r.bit()?;
    let bottom_field_pic_order_present = r.bit()?;
    if r.ue()? > 0 {
        return Err(BitstreamError::Unsupported("slice groups"));
    }
    let num_ref_idx_l0_default = r.ue()? + 1;
    let num_ref_idx_l1_default = r.ue()? + 1;
    let weighted_pred = r.bit()?;
    let weighted_bipred_idc = r.bits(2)?;
    let pic_init_qp_minus26 = r.se()?;
    let _pic_init_qs_minus26 = r.se()?;
    let _chroma_qp_index_offset = r.se()?;
    let deblocking_filter_control_present = r.bit()?;
    let _constrained_intra_pred = r.bit()?;
    let redundant_pic_cnt_present = r.bit()?;

    Ok(Pps {
        id,
        sps_id,
        entropy_coding_mode,
        bottom_field_pic_order_present,
        num_ref_idx_l0_default,
        num_ref_idx_l1_default,
        weighted_pred,
        weighted_bipred_idc,
        pic_init_qp_minus26,
        deblocking_filter_control_present,
        redundant_pic_cnt_present,
    })
}

fn skip_ref_pic_list_modification(r: &mut BitReader<'_>) -> Result<(), BitstreamError> {
    if !r.bit()? {
        return Ok(());
    }
    loop {
        match r.ue()? {
            3 => return Ok(()),
            0..=2 | 4 | 5 => {
                r.ue()?;
            }
            _ => return Err(BitstreamError::Malformed("modification_of_pic_nums_idc")),
        }
    }
}

fn skip_pred_weight_table(
    r: &mut BitReader<'_>,
    chroma_array_type: u32,
    refs: &[u32],
) -> Result<(), BitstreamError> {
    let _luma_log2_weight_denom = r.ue()?;
    if chroma_array_type != 0 {
        let _chroma_log2_weight_denom = r.ue()?;
    }
    for &count in refs {
        for _ in 0..count {
            if r.bit()? {
                r.se()?;
                r.se()?;
            }
            if chroma_array_type != 0 && r.bit()? {
                for _ in 0..2 {
                    r.se()?;
                    r.se()?;
                }
            }
        }
    }
    Ok(())
}

fn skip_dec_ref_pic_marking(r: &mut BitReader<'_>, idr: bool) -> Result<(), BitstreamError> {
    if idr {
        r.skip(2)?; // no_output_of_prior_pics, long_term_reference
        return Ok(());
    }
    if !r.bit()? {
        return Ok(());
    }
    loop {
        match r.ue()? {
            0 => return Ok(()),
            1 | 2 | 4 | 6 => {
                r.ue()?;
            }
            3 => {
                r.ue()?;
                r.ue()?;
            }
            5 => {}
            _ => return Err(BitstreamError::Malformed("memory_management_control_operation")),
        }
    }
}

/// Stateful QP extractor for one H.264 stream.
#[derive(Debug, Default)]
pub struct H264Parser {
    sps: HashMap<u32, Sps>,
    pps: HashMap<u32, Pps>,
}

impl H264Parser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed every unit of an access unit and return the QP of its last
    /// slice, or `None` if no slice could be parsed.
    pub fn parse_access_unit(&mut self, data: &[u8], units: &[NalUnit]) -> Option<u8> {
        let mut qp = None;
        for unit in units {
            match self.parse_nal(unit.payload(data)) {
                Ok(Some(slice_qp)) => qp = Some(slice_qp),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(nal_type = unit.nal_type, error = %e, "NAL unit not parsed");
                }
            }
        }
        qp
    }

    /// Parse one NAL unit (header byte included, start code excluded).
    ///
    /// Parameter sets are stored; slices return their QP.
    ///
    /// # Errors
    ///
    /// [`BitstreamError`] if the unit is truncated, malformed, or
    /// references parameter sets not seen yet.
    pub fn parse_nal(&mut self, nal: &[u8]) -> Result<Option<u8>, BitstreamError> {
        let Some((&header, payload)) = nal.split_first() else {
            return Ok(None);
        };
        if header & 0x80 != 0 {
            return Err(BitstreamError::Malformed("forbidden_zero_bit set"));
        }
        let nal_ref_idc = (header >> 5) & 0x03;
        let nal_type = header & 0x1F;
        match nal_type {
            NAL_SPS => {
                let sps = parse_sps(&unescape(payload))?;
                tracing::trace!(id = sps.id, profile = sps.profile_idc, level = sps.level_idc, "SPS");
                self.sps.insert(sps.id, sps);
                Ok(None)
            }
            NAL_PPS => {
                let pps = parse_pps(&unescape(payload))?;
                tracing::trace!(id = pps.id, sps_id = pps.sps_id, "PPS");
                self.pps.insert(pps.id, pps);
                Ok(None)
            }
            NAL_SLICE | NAL_IDR => {
                let rbsp = unescape(payload);
                self.slice_qp(&rbsp, nal_ref_idc, nal_type == NAL_IDR).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn slice_qp(&self, rbsp: &[u8], nal_ref_idc: u8, idr: bool) -> Result<u8, BitstreamError> {
        let mut r = BitReader::new(rbsp);
        let _first_mb_in_slice = r.ue()?;
        let slice_type = SliceType::from_code(r.ue()?);
        let pps_id = r.ue()?;
        let pps = self
            .pps
            .get(&pps_id)
            .ok_or(BitstreamError::MissingParameterSet { kind: "PPS", id: pps_id })?;
        let sps = self.sps.get(&pps.sps_id).ok_or(BitstreamError::MissingParameterSet {
            kind: "SPS",
            id: pps.sps_id,
        })?;

        if sps.separate_colour_plane {
            r.skip(2)?; // colour_plane_id
        }
        r.skip(sps.log2_max_frame_num as usize)?; // frame_num
        let mut field_pic = false;
        if !sps.frame_mbs_only {
            field_pic = r.bit()?;
            if field_pic {
                r.skip(1)?; // bottom_field_flag
            }
        }
        if idr {
            let _idr_pic_id = r.ue()?;
        }
        if sps.pic_order_cnt_type == 0 {
            r.skip(sps.log2_max_poc_lsb as usize)?;
            if pps.bottom_field_pic_order_present && !field_pic {
                r.se()?;
            }
        }
        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero {
            r.se()?;
            if pps.bottom_field_pic_order_present && !field_pic {
                r.se()?;
            }
        }
        if pps.redundant_pic_cnt_present {
            r.ue()?;
        }
        if slice_type == SliceType::B {
            r.skip(1)?; // direct_spatial_mv_pred_flag
        }

        let mut num_ref_l0 = pps.num_ref_idx_l0_default;
        let mut num_ref_l1 = pps.num_ref_idx_l1_default;
        if matches!(slice_type, SliceType::P | SliceType::Sp | SliceType::B) && r.bit()? {
            num_ref_l0 = r.ue()? + 1;
            if slice_type == SliceType::B {
                num_ref_l1 = r.ue()? + 1;
            }
        }
        if num_ref_l0 > 32 || num_ref_l1 > 32 {
            return Err(BitstreamError::Malformed("num_ref_idx_active out of range"));
        }

        if !slice_type.is_intra() {
            skip_ref_pic_list_modification(&mut r)?;
            if slice_type == SliceType::B {
                skip_ref_pic_list_modification(&mut r)?;
            }
        }

        let weighted = (pps.weighted_pred && matches!(slice_type, SliceType::P | SliceType::Sp))
            || (pps.weighted_bipred_idc == 1 && slice_type == SliceType::B);
        if weighted {
            let lists: &[u32] = if slice_type == SliceType::B {
                &[num_ref_l0, num_ref_l1]
            } else {
                &[num_ref_l0]
            };
            skip_pred_weight_table(&mut r, sps.chroma_array_type(), lists)?;
        }

        if nal_ref_idc != 0 {
            skip_dec_ref_pic_marking(&mut r, idr)?;
        }
        if pps.entropy_coding_mode && !slice_type.is_intra() {
            let _cabac_init_idc = r.ue()?;
        }
        let slice_qp_delta = r.se()?;

        let qp = 26 + pps.pic_init_qp_minus26 + slice_qp_delta;
        if !(0..=MAX_QP).contains(&qp) {
            return Err(BitstreamError::Malformed("slice QP out of range"));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let qp = qp as u8;
        Ok(qp)
    }
}

#[cfg(test)]
mod tests {
    use super::super::rbsp::{escape, BitWriter};
    use super::super::frame_access_unit;
    use super::*;

    fn nal(header: u8, rbsp: &[u8]) -> Vec<u8> {
        let mut out = vec![header];
        out.extend(escape(rbsp));
        out
    }

    fn high_sps(poc_type: u32, frame_mbs_only: bool) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.bits(100, 8);
        w.bits(0, 8);
        w.bits(51, 8);
        w.ue(0); // sps id
        w.ue(1); // 4:2:0
        w.ue(0);
        w.ue(0);
        w.bit(false);
        w.bit(true); // scaling matrix present
        for i in 0..8 {
            // Only list 0 carries data: one delta that zeroes nextScale.
            w.bit(i == 0);
            if i == 0 {
                w.se(-8);
            }
        }
        w.ue(0); // log2_max_frame_num - 4
        w.ue(poc_type);
        if poc_type == 0 {
            w.ue(2); // log2_max_poc_lsb - 4
        } else if poc_type == 1 {
            w.bit(false);
            w.se(1);
            w.se(-1);
            w.ue(1);
            w.se(2);
        }
        w.ue(4);
        w.bit(false);
        w.ue(39);
        w.ue(29);
        w.bit(frame_mbs_only);
        w.bit(true); // direct_8x8_inference
        w.bit(false);
        w.bit(false);
        w.finish()
    }

    fn pps(cabac: bool, weighted: bool, init_qp_minus26: i32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0);
        w.ue(0);
        w.bit(cabac);
        w.bit(true); // bottom_field_pic_order_in_frame_present
        w.ue(0);
        w.ue(0);
        w.ue(0);
        w.bit(weighted);
        w.bits(0, 2);
        w.se(init_qp_minus26);
        w.se(0);
        w.se(0);
        w.bit(true);
        w.bit(false);
        w.bit(false);
        w.finish()
    }

    #[test]
    fn parses_high_profile_sps_with_scaling_lists() {
        let sps = parse_sps(&high_sps(0, true)).unwrap();
        assert_eq!(sps.profile_idc, 100);
        assert_eq!(sps.level_idc, 51);
        assert_eq!(sps.log2_max_poc_lsb, 6);
        assert_eq!(sps.width_mbs, 40);
        assert_eq!(sps.height_map_units, 30);
        assert!(sps.frame_mbs_only);
    }

    #[test]
    fn pps_with_slice_groups_is_unsupported() {
        let mut w = BitWriter::new();
        w.ue(0);
        w.ue(0);
        w.bit(false);
        w.bit(false);
        w.ue(1);
        assert_eq!(
            parse_pps(&w.finish()),
            Err(BitstreamError::Unsupported("slice groups"))
        );
    }

    #[test]
    fn idr_slice_qp_with_poc_type_zero() {
        let mut parser = H264Parser::new();
        parser.parse_nal(&nal(0x67, &high_sps(0, true))).unwrap();
        parser.parse_nal(&nal(0x68, &pps(false, false, -4))).unwrap();

        let mut w = BitWriter::new();
        w.ue(0); // first_mb
        w.ue(7); // I
        w.ue(0); // pps
        w.bits(0, 4); // frame_num
        w.ue(0); // idr_pic_id
        w.bits(0, 6); // poc lsb
        w.se(0); // delta_pic_order_cnt_bottom
        w.bit(false);
        w.bit(false); // dec_ref_pic_marking
        w.se(6);
        let slice = nal(0x65, &w.finish());
        assert_eq!(parser.parse_nal(&slice), Ok(Some(28)));
    }

    #[test]
    fn cabac_p_slice_with_weights_and_fields() {
        let mut parser = H264Parser::new();
        parser.parse_nal(&nal(0x67, &high_sps(1, false))).unwrap();
        parser.parse_nal(&nal(0x68, &pps(true, true, 0))).unwrap();

        let mut w = BitWriter::new();
        w.ue(0);
        w.ue(5); // P
        w.ue(0);
        w.bits(3, 4); // frame_num
        w.bit(false); // field_pic_flag
        w.se(0); // delta_pic_order_cnt[0]
        w.se(0); // delta_pic_order_cnt[1]
        w.bit(true); // num_ref_idx_override
        w.ue(1); // two refs in l0
        w.bit(true); // ref_pic_list_modification_flag_l0
        w.ue(0);
        w.ue(2);
        w.ue(3);
        // pred_weight_table
        w.ue(5);
        w.ue(5);
        w.bit(true);
        w.se(3);
        w.se(-1);
        w.bit(false);
        w.bit(false);
        w.bit(true);
        w.se(1);
        w.se(1);
        w.se(1);
        w.se(1);
        // dec_ref_pic_marking with one MMCO 3 then end
        w.bit(true);
        w.ue(3);
        w.ue(1);
        w.ue(0);
        w.ue(0);
        w.ue(1); // cabac_init_idc
        w.se(-6);
        let slice = nal(0x41, &w.finish());
        assert_eq!(parser.parse_nal(&slice), Ok(Some(20)));
    }

    #[test]
    fn slice_before_parameter_sets_has_no_qp() {
        let mut parser = H264Parser::new();
        let mut w = BitWriter::new();
        w.ue(0);
        w.ue(5);
        w.ue(0);
        let slice = nal(0x41, &w.finish());
        assert_eq!(
            parser.parse_nal(&slice),
            Err(BitstreamError::MissingParameterSet { kind: "PPS", id: 0 })
        );
    }

    #[test]
    fn truncated_slice_leaves_qp_unset() {
        let mut parser = H264Parser::new();
        parser.parse_nal(&nal(0x67, &high_sps(2, true))).unwrap();
        parser.parse_nal(&nal(0x68, &pps(false, false, 0))).unwrap();

        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1, 0x41, 0x9A]);
        let layout = frame_access_unit(&data);
        assert_eq!(parser.parse_access_unit(&data, &layout.units), None);
    }

    #[test]
    fn access_unit_reports_last_slice_qp() {
        let mut data = Vec::new();
        for unit in [nal(0x67, &high_sps(2, true)), nal(0x68, &pps(false, false, 2))] {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend(unit);
        }
        for delta in [0, 3] {
            let mut w = BitWriter::new();
            w.ue(0);
            w.ue(7);
            w.ue(0);
            w.bits(0, 4);
            w.ue(0);
            w.bit(false);
            w.bit(false);
            w.se(delta);
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend(nal(0x65, &w.finish()));
        }
        let layout = frame_access_unit(&data);
        assert!(layout.key_frame);
        let mut parser = H264Parser::new();
        assert_eq!(parser.parse_access_unit(&data, &layout.units), Some(31));
    }
}
