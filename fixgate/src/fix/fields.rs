//! FIX dictionary subset spoken by the engine: tags, message types and
//! reject reasons for the session layer plus the application messages the
//! validator knows about.

#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

/// Session-layer (administrative) message types are handled by the engine
/// itself; everything else is delivered to application handlers.
pub fn is_session_message(msg_type: char) -> bool {
    matches!(msg_type, '0' | '1' | '2' | '3' | '4' | '5' | 'A')
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tags {
    AvgPx = 6,
    BeginSeqNo = 7,
    BeginString = 8,
    BodyLength = 9,
    CheckSum = 10,
    ClOrdID = 11,
    CumQty = 14,
    EndSeqNo = 16,
    ExecID = 17,
    MsgSeqNum = 34,
    MsgType = 35,
    NewSeqNo = 36,
    OrderID = 37,
    OrderQty = 38,
    OrdStatus = 39,
    OrdType = 40,
    PossDupFlag = 43,
    Price = 44,
    RefSeqNum = 45,
    SenderCompID = 49,
    SendingTime = 52,
    Side = 54,
    Symbol = 55,
    TargetCompID = 56,
    Text = 58,
    EncryptMethod = 98,
    HeartBtInt = 108,
    TestReqID = 112,
    OrigSendingTime = 122,
    GapFillFlag = 123,
    ResetSeqNumFlag = 141,
    ExecType = 150,
    LeavesQty = 151,
    RefTagID = 371,
    RefMsgType = 372,
    SessionRejectReason = 373,
    BusinessRejectReason = 380,
    Username = 553,
    Password = 554,
}

impl From<Tags> for u32 {
    fn from(t: Tags) -> u32 {
        t as u32
    }
}

impl TryFrom<u32> for Tags {
    type Error = u32;
    fn try_from(v: u32) -> Result<Tags, u32> {
        match v {
            6 => Ok(Tags::AvgPx),
            7 => Ok(Tags::BeginSeqNo),
            8 => Ok(Tags::BeginString),
            9 => Ok(Tags::BodyLength),
            10 => Ok(Tags::CheckSum),
            11 => Ok(Tags::ClOrdID),
            14 => Ok(Tags::CumQty),
            16 => Ok(Tags::EndSeqNo),
            17 => Ok(Tags::ExecID),
            34 => Ok(Tags::MsgSeqNum),
            35 => Ok(Tags::MsgType),
            36 => Ok(Tags::NewSeqNo),
            37 => Ok(Tags::OrderID),
            38 => Ok(Tags::OrderQty),
            39 => Ok(Tags::OrdStatus),
            40 => Ok(Tags::OrdType),
            43 => Ok(Tags::PossDupFlag),
            44 => Ok(Tags::Price),
            45 => Ok(Tags::RefSeqNum),
            49 => Ok(Tags::SenderCompID),
            52 => Ok(Tags::SendingTime),
            54 => Ok(Tags::Side),
            55 => Ok(Tags::Symbol),
            56 => Ok(Tags::TargetCompID),
            58 => Ok(Tags::Text),
            98 => Ok(Tags::EncryptMethod),
            108 => Ok(Tags::HeartBtInt),
            112 => Ok(Tags::TestReqID),
            122 => Ok(Tags::OrigSendingTime),
            123 => Ok(Tags::GapFillFlag),
            141 => Ok(Tags::ResetSeqNumFlag),
            150 => Ok(Tags::ExecType),
            151 => Ok(Tags::LeavesQty),
            371 => Ok(Tags::RefTagID),
            372 => Ok(Tags::RefMsgType),
            373 => Ok(Tags::SessionRejectReason),
            380 => Ok(Tags::BusinessRejectReason),
            553 => Ok(Tags::Username),
            554 => Ok(Tags::Password),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    HEARTBEAT,
    TEST_REQUEST,
    RESEND_REQUEST,
    REJECT,
    SEQUENCE_RESET,
    LOGOUT,
    LOGON,
    EXECUTION_REPORT,
    ORDER_SINGLE,
    BUSINESS_MESSAGE_REJECT,
}

impl MsgType {
    pub fn is_session(&self) -> bool {
        matches!(
            self,
            MsgType::HEARTBEAT
                | MsgType::TEST_REQUEST
                | MsgType::RESEND_REQUEST
                | MsgType::REJECT
                | MsgType::SEQUENCE_RESET
                | MsgType::LOGOUT
                | MsgType::LOGON
        )
    }
    pub fn is_application(&self) -> bool {
        !self.is_session()
    }
}

impl From<MsgType> for char {
    fn from(m: MsgType) -> char {
        match m {
            MsgType::HEARTBEAT => '0',
            MsgType::TEST_REQUEST => '1',
            MsgType::RESEND_REQUEST => '2',
            MsgType::REJECT => '3',
            MsgType::SEQUENCE_RESET => '4',
            MsgType::LOGOUT => '5',
            MsgType::LOGON => 'A',
            MsgType::EXECUTION_REPORT => '8',
            MsgType::ORDER_SINGLE => 'D',
            MsgType::BUSINESS_MESSAGE_REJECT => 'j',
        }
    }
}

impl From<MsgType> for &'static [u8] {
    fn from(m: MsgType) -> &'static [u8] {
        match m {
            MsgType::HEARTBEAT => b"0",
            MsgType::TEST_REQUEST => b"1",
            MsgType::RESEND_REQUEST => b"2",
            MsgType::REJECT => b"3",
            MsgType::SEQUENCE_RESET => b"4",
            MsgType::LOGOUT => b"5",
            MsgType::LOGON => b"A",
            MsgType::EXECUTION_REPORT => b"8",
            MsgType::ORDER_SINGLE => b"D",
            MsgType::BUSINESS_MESSAGE_REJECT => b"j",
        }
    }
}

impl TryFrom<char> for MsgType {
    type Error = char;
    fn try_from(c: char) -> Result<MsgType, char> {
        match c {
            '0' => Ok(MsgType::HEARTBEAT),
            '1' => Ok(MsgType::TEST_REQUEST),
            '2' => Ok(MsgType::RESEND_REQUEST),
            '3' => Ok(MsgType::REJECT),
            '4' => Ok(MsgType::SEQUENCE_RESET),
            '5' => Ok(MsgType::LOGOUT),
            'A' => Ok(MsgType::LOGON),
            '8' => Ok(MsgType::EXECUTION_REPORT),
            'D' => Ok(MsgType::ORDER_SINGLE),
            'j' => Ok(MsgType::BUSINESS_MESSAGE_REJECT),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejectReason {
    INVALID_TAG_NUMBER,
    REQUIRED_TAG_MISSING,
    TAG_NOT_DEFINED_FOR_THIS_MESSAGE_TYPE,
    UNDEFINED_TAG,
    TAG_SPECIFIED_WITHOUT_A_VALUE,
    VALUE_IS_INCORRECT,
    INCORRECT_DATA_FORMAT_FOR_VALUE,
    COMPID_PROBLEM,
    SENDINGTIME_ACCURACY_PROBLEM,
    INVALID_MSGTYPE,
}

impl From<&SessionRejectReason> for u32 {
    fn from(r: &SessionRejectReason) -> u32 {
        match *r {
            SessionRejectReason::INVALID_TAG_NUMBER => 0,
            SessionRejectReason::REQUIRED_TAG_MISSING => 1,
            SessionRejectReason::TAG_NOT_DEFINED_FOR_THIS_MESSAGE_TYPE => 2,
            SessionRejectReason::UNDEFINED_TAG => 3,
            SessionRejectReason::TAG_SPECIFIED_WITHOUT_A_VALUE => 4,
            SessionRejectReason::VALUE_IS_INCORRECT => 5,
            SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE => 6,
            SessionRejectReason::COMPID_PROBLEM => 9,
            SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM => 10,
            SessionRejectReason::INVALID_MSGTYPE => 11,
        }
    }
}

impl From<&SessionRejectReason> for String {
    fn from(r: &SessionRejectReason) -> String {
        let text = match *r {
            SessionRejectReason::INVALID_TAG_NUMBER => "Invalid tag number",
            SessionRejectReason::REQUIRED_TAG_MISSING => "Required tag missing",
            SessionRejectReason::TAG_NOT_DEFINED_FOR_THIS_MESSAGE_TYPE => {
                "Tag not defined for this message type"
            }
            SessionRejectReason::UNDEFINED_TAG => "Undefined tag",
            SessionRejectReason::TAG_SPECIFIED_WITHOUT_A_VALUE => "Tag specified without a value",
            SessionRejectReason::VALUE_IS_INCORRECT => "Value is incorrect",
            SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE => {
                "Incorrect data format for value"
            }
            SessionRejectReason::COMPID_PROBLEM => "CompID problem",
            SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM => "SendingTime accuracy problem",
            SessionRejectReason::INVALID_MSGTYPE => "Invalid MsgType",
        };
        String::from(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusinessRejectReason {
    OTHER,
    UNKNOWN_ID,
    UNKNOWN_SECURITY,
    UNSUPPORTED_MESSAGE_TYPE,
    APPLICATION_NOT_AVAILABLE,
    CONDITIONALLY_REQUIRED_FIELD_MISSING,
}

impl From<&BusinessRejectReason> for u32 {
    fn from(r: &BusinessRejectReason) -> u32 {
        match *r {
            BusinessRejectReason::OTHER => 0,
            BusinessRejectReason::UNKNOWN_ID => 1,
            BusinessRejectReason::UNKNOWN_SECURITY => 2,
            BusinessRejectReason::UNSUPPORTED_MESSAGE_TYPE => 3,
            BusinessRejectReason::APPLICATION_NOT_AVAILABLE => 4,
            BusinessRejectReason::CONDITIONALLY_REQUIRED_FIELD_MISSING => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PossDupFlag {
    YES,
    NO,
}

impl TryFrom<char> for PossDupFlag {
    type Error = char;
    fn try_from(c: char) -> Result<PossDupFlag, char> {
        match c {
            'Y' => Ok(PossDupFlag::YES),
            'N' => Ok(PossDupFlag::NO),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapFillFlag {
    YES,
    NO,
}

impl TryFrom<char> for GapFillFlag {
    type Error = char;
    fn try_from(c: char) -> Result<GapFillFlag, char> {
        match c {
            'Y' => Ok(GapFillFlag::YES),
            'N' => Ok(GapFillFlag::NO),
            other => Err(other),
        }
    }
}
