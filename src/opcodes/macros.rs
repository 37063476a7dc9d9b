macro_rules! opcode_serde {
    ($type:ty) => {
        fn serialize(&self) -> Vec<u8> {
            let length = self.data.len() as $type;
            std::iter::once(self.value()).chain(length.to_le_bytes()).chain(self.data.iter().copied()).collect()
        }

        fn deserialize<'i, I: Iterator<Item = &'i u8>>(it: &mut I) -> Result<Box<dyn OpCodeImplementation>, TxScriptError> {
            let length_bytes: Vec<u8> = it.take(size_of::<$type>()).copied().collect();
            if length_bytes.len() != size_of::<$type>() {
                return Err(TxScriptError::MalformedPushSize(length_bytes));
            }
            let length = <$type>::from_le_bytes(length_bytes.try_into().expect("size checked above")) as usize;
            let data: Vec<u8> = it.take(length).copied().collect();
            if data.len() != length {
                return Err(TxScriptError::MalformedPush(length, data.len()));
            }
            Ok(Box::new(Self { data }))
        }
    };
    ($length: literal) => {
        fn serialize(&self) -> Vec<u8> {
            std::iter::once(self.value()).chain(self.data.iter().copied()).collect()
        }

        fn deserialize<'i, I: Iterator<Item = &'i u8>>(it: &mut I) -> Result<Box<dyn OpCodeImplementation>, TxScriptError> {
            // The declared length includes the opcode byte itself.
            let data: Vec<u8> = it.take($length - 1).copied().collect();
            if data.len() != $length - 1 {
                return Err(TxScriptError::MalformedPush($length - 1, data.len()));
            }
            Ok(Box::new(Self { data }))
        }
    };
}

macro_rules! opcode {
    ($name:ident, $num:literal, $length:tt, $code:expr, $self:ident, $vm:ident) => {
        pub(crate) type $name = OpCode<$num>;

        impl OpcodeSerialization for $name {
            opcode_serde!($length);
        }

        impl OpCodeExecution for $name {
            fn empty() -> Result<Box<dyn OpCodeImplementation>, TxScriptError> {
                Self::new(vec![])
            }

            fn new(data: Vec<u8>) -> Result<Box<dyn OpCodeImplementation>, TxScriptError> {
                Ok(Box::new(Self { data }))
            }

            #[allow(unused_variables)]
            fn execute(&$self, $vm: &mut TxScriptEngine) -> OpCodeResult {
                $code
            }
        }

        impl OpCodeImplementation for $name {}
    };
}

macro_rules! opcode_list {
    ( $( opcode $(|$alias:ident|)? $name:ident<$num:literal, $length:tt>($self:ident, $vm:ident) $code:expr )* ) => {
        /// Opcode numbers, named after the opcodes themselves.
        pub mod codes {
            $(
                #[allow(non_upper_case_globals)]
                #[allow(dead_code)]
                pub const $name: u8 = $num;
                $(
                    #[allow(non_upper_case_globals)]
                    #[allow(dead_code)]
                    pub const $alias: u8 = $num;
                )?
            )*
        }

        $(
            opcode!($name, $num, $length, $code, $self, $vm);
        )*

        /// Reads a single opcode together with its immediate data from the
        /// byte iterator. Returns `None` once the iterator is exhausted.
        /// This is the tokenizer the engine and the parse checks run on.
        pub(crate) fn deserialize_next_opcode<'i, I: Iterator<Item = &'i u8>>(
            it: &mut I,
        ) -> Option<Result<Box<dyn OpCodeImplementation>, TxScriptError>> {
            it.next().map(|opcode_num| match *opcode_num {
                $(
                    $num => $name::deserialize(it),
                )*
            })
        }
    };
}
